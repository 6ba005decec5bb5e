//! # Scheduler Module
//!
//! The cadence that invokes the relay cycle: a `tokio-cron-scheduler` job on
//! a six-field cron expression in UTC, with an optional run at startup.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Cron-driven trigger for the relay cycle.
pub mod timer_trigger;

pub use timer_trigger::{PAST_DUE_TOLERANCE, TimerInfo, TimerTrigger, TriggerError, fire};
