//! # Utilities Module
//!
//! Small helpers shared by the relay components.
//!
//! ## Contained Modules:
//!
//! - **`time`**: UTC timestamps used to stamp every tick.
//! - **`redact`**: masking of URLs before they reach a log line.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// UTC timestamp helpers.
pub mod time;
/// Log-safe rendering of URLs.
pub mod redact;

/// User agent sent on every outbound HTTP request.
pub const USER_AGENT: &str = concat!("stream-to-eventhub/", env!("CARGO_PKG_VERSION"));

pub use redact::redact_url;
pub use time::current_utc_timestamp;
