//! # Event Hub Publisher
//!
//! Turns a resolved secret, a routing name and a fetched payload into one
//! published event: compose the connection descriptor, open a producer
//! client, encode, send a single-event batch, close.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, warn};

use super::amqp_websocket::AmqpWebSocketConnector;
use super::connection_string::{ConnectionStringError, EXPECTED_SHAPE, build_connection_descriptor};
use super::event_data::{EncodeError, EventData};
use super::producer::{EventHubProducerClient, HttpsConnector, TransportConnector, TransportError};
use crate::secrets::SecretValue;

/// Operator guidance attached to every authentication failure.
pub const AUTH_DIAGNOSTIC: &str = "There is an issue with the credentials or tokens used for authentication. \
This can happen if the connection string, shared access key, or token has expired or is incorrect. \
Check your connection string format, it should look like this: \
Endpoint=sb://<NAME_SPACE>.servicebus.windows.net/;SharedAccessKeyName=<KEY_NAME>;SharedAccessKey=<KEY_VALUE>;EntityPath=<EVENT_HUB_NAME>";

/// Why a publish failed. Nothing is retried.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The event hub rejected the connection descriptor.
    #[error("authentication error: {source}. {diagnostic}")]
    Authentication {
        /// Expected connection-string shape and common causes.
        diagnostic: &'static str,
        /// The rejection.
        #[source]
        source: TransportError,
    },

    /// The secret plus routing name do not form a usable connection string.
    #[error("invalid connection descriptor: {0}")]
    InvalidDescriptor(#[from] ConnectionStringError),

    /// The payload could not be encoded.
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// The encoded payload, as framed on the wire, does not fit in one batch.
    #[error("encoded payload of {size} bytes on the wire exceeds the {max} byte batch limit")]
    MessageTooLarge {
        /// Framed size.
        size: usize,
        /// Batch limit.
        max: usize,
    },

    /// Network-level failure while submitting.
    #[error("transport error: {0}")]
    Transport(#[source] TransportError),
}

impl PublishError {
    /// Classifies a transport failure: credential rejections become
    /// [`PublishError::Authentication`], everything else stays a transport error.
    pub fn from_transport(err: TransportError) -> Self {
        if err.is_unauthorized() {
            PublishError::Authentication {
                diagnostic: AUTH_DIAGNOSTIC,
                source: err,
            }
        } else {
            PublishError::Transport(err)
        }
    }

    /// True for [`PublishError::Authentication`].
    pub fn is_authentication(&self) -> bool {
        matches!(self, PublishError::Authentication { .. })
    }
}

/// Publishes one payload per call.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Sends `payload` as a single event to `routing_name`, authenticating
    /// with the namespace connection string in `secret`.
    async fn publish(
        &self,
        secret: &SecretValue,
        routing_name: &str,
        payload: &Value,
    ) -> Result<(), PublishError>;
}

/// [`EventPublisher`] that opens a fresh producer client per call.
pub struct EventHubPublisher {
    connector: Arc<dyn TransportConnector>,
}

impl EventHubPublisher {
    /// Uses `connector` to open each client's transport.
    pub fn new(connector: Arc<dyn TransportConnector>) -> Self {
        Self { connector }
    }

    /// Publishes over HTTPS with the given request timeout.
    pub fn https(timeout: Duration) -> Self {
        Self::new(Arc::new(HttpsConnector::new(timeout)))
    }

    /// Publishes with AMQP over WebSockets; connecting and each send are
    /// bounded by `timeout`.
    pub fn amqp_websockets(timeout: Duration) -> Self {
        Self::new(Arc::new(AmqpWebSocketConnector::new(timeout)))
    }
}

#[async_trait]
impl EventPublisher for EventHubPublisher {
    async fn publish(
        &self,
        secret: &SecretValue,
        routing_name: &str,
        payload: &Value,
    ) -> Result<(), PublishError> {
        let descriptor = build_connection_descriptor(secret, routing_name)
            .map_err(|err| report(PublishError::from(err)))?;

        let mut client =
            EventHubProducerClient::from_connection_string(&descriptor, routing_name, self.connector.as_ref())
                .await
                .map_err(report)?;

        let sent = send_single(&mut client, payload).await;
        let closed = client.close().await;

        match (sent, closed) {
            (Ok(size), Ok(())) => {
                info!("Event data successfully sent to '{}' ({} bytes)", routing_name, size);
                Ok(())
            }
            (Ok(size), Err(close_err)) => {
                warn!(
                    "Event data sent to '{}' ({} bytes) but the client did not close cleanly: {}",
                    routing_name, size, close_err
                );
                Ok(())
            }
            (Err(send_err), closed) => {
                if let Err(close_err) = closed {
                    warn!("Failed to close producer client after a failed send: {}", close_err);
                }
                Err(report(send_err))
            }
        }
    }
}

async fn send_single(client: &mut EventHubProducerClient, payload: &Value) -> Result<usize, PublishError> {
    let event = EventData::from_json(payload)?;

    let mut batch = client.create_batch();
    let size = batch.size_with(&event);
    let max = batch.max_size_bytes();
    batch
        .try_add(event)
        .map_err(|_| PublishError::MessageTooLarge { size, max })?;

    client.send_batch(&batch).await?;
    Ok(size)
}

fn report(err: PublishError) -> PublishError {
    match &err {
        PublishError::Authentication { diagnostic, source } => {
            error!("Authentication Error! {} ({})", diagnostic, source);
        }
        PublishError::InvalidDescriptor(reason) => {
            error!(
                "Connection descriptor rejected: {}. Expected shape: {}",
                reason, EXPECTED_SHAPE
            );
        }
        _ => {}
    }
    err
}
