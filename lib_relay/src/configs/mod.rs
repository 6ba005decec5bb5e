//! # Configuration Module
//!
//! Layered configuration for the relay: built-in defaults, an optional JSON
//! file, environment variables and CLI flags, lowest precedence first.
//!
//! ## Contained Modules:
//!
//! - **`relay_config`**: the all-optional `RelayConfig` (clap + serde), its
//!   merge and the validation into an immutable `RelaySettings`.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Layered relay configuration.
pub mod relay_config;

// --- Public API Re-exports ---
pub use relay_config::{
    ConfigError, ConfigNotice, DEFAULT_CONFIG_FILE, DEFAULT_SCHEDULE, PublishTransport, RelayConfig,
    RelaySettings, load_config, resolve_config,
};
