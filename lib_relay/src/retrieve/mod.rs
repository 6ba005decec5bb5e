//! # Data Retrieval Module
//!
//! The single-shot HTTP client that pulls one JSON snapshot from the source
//! API per invocation.
//!
//! ## Purpose:
//! Isolates the HTTP concerns of polling (client construction, status
//! checking, JSON decoding) from the relay cycle, which only sees a
//! [`SourceFetcher`] returning a `serde_json::Value`.
//!
//! ## Contained Modules:
//!
//! - **`source_fetcher`**: `SourceFetcher` trait and the reqwest-backed
//!   `HttpSourceFetcher`. No retries: a failed poll fails the invocation and
//!   the next tick is the retry.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// HTTP GET + JSON decode of the source API.
pub mod source_fetcher;

// --- Public API Re-exports ---
pub use source_fetcher::{FetchError, HttpSourceFetcher, SourceFetcher, build_http_client};
