//! # Loggers Module
//!
//! `tracing` subscriber setup: coloured console output plus a daily-rotated
//! JSON log file written through a non-blocking worker.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Subscriber and file appender construction.
pub mod tracing_setup;

pub use tracing_setup::{LogOptions, LoggingError, build_env_filter, build_file_appender, setup_logging};
