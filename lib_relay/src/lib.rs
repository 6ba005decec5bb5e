//! # lib_relay
//!
//! Scheduled data relay: on every tick it resolves an event hub connection
//! secret from a key vault, polls a JSON API once and publishes the snapshot
//! as a single event.
//!
//! Modules are gated by folder, mirroring the feature list in `Cargo.toml`:
//!
//! - **`configs`**: layered configuration validated into [`configs::RelaySettings`].
//! - **`loggers`**: `tracing` subscriber with console and rolling JSON file output.
//! - **`utils`**: UTC timestamps and URL redaction.
//! - **`secrets`**: identity credentials and the key vault secret resolver.
//! - **`retrieve`**: the single-shot HTTP JSON source fetcher.
//! - **`publishers`**: connection strings, SAS signing and the event hub producer.
//! - **`ingestors`**: the relay cycle chaining the three components.
//! - **`scheduler`**: the cron timer trigger.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

#[cfg(feature = "configs")]
pub mod configs;
#[cfg(feature = "ingestors")]
pub mod ingestors;
#[cfg(feature = "loggers")]
pub mod loggers;
#[cfg(feature = "publishers")]
pub mod publishers;
#[cfg(feature = "retrieve")]
pub mod retrieve;
#[cfg(feature = "scheduler")]
pub mod scheduler;
#[cfg(feature = "secrets")]
pub mod secrets;
#[cfg(feature = "utils")]
pub mod utils;

#[cfg(test)]
pub(crate) mod test_support;
