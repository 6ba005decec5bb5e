//! # Publishers Module
//!
//! Delivers one fetched payload to an event hub per invocation.
//!
//! ## Contained Modules:
//!
//! - **`connection_string`**: `key=value;` parsing and the `EntityPath` composition.
//! - **`sas_token`**: HMAC-SHA256 shared access signatures.
//! - **`event_data`**: JSON encoding of the payload and the send batch.
//! - **`producer`**: the producer client, its pluggable transport and the HTTPS fallback.
//! - **`amqp_websocket`**: the default transport, AMQP tunnelled over WebSockets.
//! - **`eventhub`**: the `EventPublisher` seam and its failure taxonomy.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Connection string grammar and descriptor composition.
pub mod connection_string;
/// Event bodies and batches.
pub mod event_data;
/// The publish step.
pub mod eventhub;
/// Producer client and transports.
pub mod producer;
/// Shared access signature signing.
pub mod sas_token;

/// AMQP over WebSockets transport.
pub mod amqp_websocket;

// --- Public API Re-exports ---
pub use connection_string::{
    ConnectionDescriptor, ConnectionProperties, ConnectionStringError, SasCredential,
    build_connection_descriptor,
};
pub use amqp_websocket::{AMQP_WIRE_FORMAT, AmqpWebSocketConnector, AmqpWebSocketTransport};
pub use event_data::{EncodeError, EventBatch, EventData, WireFormat, encode_payload};
pub use eventhub::{AUTH_DIAGNOSTIC, EventHubPublisher, EventPublisher, PublishError};
pub use producer::{
    EventHubProducerClient, EventTransport, HttpsConnector, HttpsTransport, REST_WIRE_FORMAT,
    TransportConnector, TransportError,
};
