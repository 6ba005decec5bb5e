//! # Ingestors Module
//!
//! The relay cycle that chains secret resolution, source polling and event
//! publishing into a single invocation.
//!
//! ## Contained Modules:
//! - **`eventhub_relay`**: `EventHubRelay`, its `run_once` cycle and the
//!   stage-tagged `RelayError`.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// The resolve, fetch, publish cycle.
pub mod eventhub_relay;

// --- Public API Re-exports ---
pub use eventhub_relay::{CycleReport, EventHubRelay, RelayError, RelayStage, RelayTarget};
