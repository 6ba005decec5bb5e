//! # AMQP over WebSockets
//!
//! The production transport: an `azeventhubs` producer whose AMQP
//! connection is tunnelled through a WebSocket on port 443, for hosts where
//! only standard web ports are reachable.
//!
//! The producer is opened per connect and closed with the transport, and its
//! built-in retry policy is turned off so a failed send surfaces at once.

use std::time::Duration;

use async_trait::async_trait;
use azeventhubs::producer::{
    EventHubProducerClient as AmqpProducer, EventHubProducerClientOptions, SendEventOptions,
};
use azeventhubs::{
    BasicRetryPolicy, EventHubConnectionOptions, EventHubsRetryOptions, EventHubsTransportType,
};
use tracing::debug;

use super::connection_string::ConnectionProperties;
use super::event_data::{EventBatch, EventData, WireFormat};
use super::producer::{EventTransport, TransportConnector, TransportError};

/// Fixed bytes an AMQP transfer adds around the events: header, properties
/// and message annotations, rounded up.
const AMQP_BATCH_OVERHEAD: usize = 512;

/// Per-event framing: the data section descriptor and length prefix, rounded up.
const AMQP_EVENT_OVERHEAD: usize = 64;

/// Framing of an AMQP send, as an upper bound.
pub const AMQP_WIRE_FORMAT: WireFormat = WireFormat {
    batch_overhead: AMQP_BATCH_OVERHEAD,
    event_size: amqp_event_size,
};

fn amqp_event_size(event: &EventData) -> usize {
    AMQP_EVENT_OVERHEAD + event.size_bytes()
}

/// Producer options: WebSocket transport, no retries, `timeout` per attempt.
pub fn producer_options(timeout: Duration) -> EventHubProducerClientOptions {
    EventHubProducerClientOptions {
        connection_options: EventHubConnectionOptions {
            transport_type: EventHubsTransportType::AmqpWebSockets,
            ..Default::default()
        },
        retry_options: EventHubsRetryOptions {
            max_retries: azeventhubs::MaxRetries(0),
            try_timeout: timeout,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Maps an AMQP failure onto [`TransportError`]. Credential rejections
/// (`amqp:unauthorized-access`, a refused CBS token) become
/// [`TransportError::AccessDenied`].
pub fn classify_amqp_error(message: String) -> TransportError {
    let lower = message.to_ascii_lowercase();
    let unauthorized = lower.contains("unauthorized")
        || lower.contains("invalidsignature")
        || lower.contains("status code: 401");
    if unauthorized {
        TransportError::AccessDenied(message)
    } else {
        TransportError::Amqp(message)
    }
}

/// [`EventTransport`] over an open AMQP WebSocket producer.
pub struct AmqpWebSocketTransport {
    producer: Option<AmqpProducer<BasicRetryPolicy>>,
    eventhub_name: String,
}

#[async_trait]
impl EventTransport for AmqpWebSocketTransport {
    async fn send(&mut self, batch: &EventBatch) -> Result<(), TransportError> {
        let producer = self.producer.as_mut().ok_or(TransportError::Closed)?;
        for event in batch.events() {
            producer
                .send_event(event.body(), SendEventOptions::new())
                .await
                .map_err(|err| classify_amqp_error(err.to_string()))?;
        }
        debug!(
            "Sent {} event(s) to '{}' over AMQP/WebSockets",
            batch.len(),
            self.eventhub_name
        );
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.producer.take() {
            Some(producer) => producer
                .close()
                .await
                .map_err(|err| classify_amqp_error(err.to_string())),
            None => Ok(()),
        }
    }

    fn wire_format(&self) -> WireFormat {
        AMQP_WIRE_FORMAT
    }
}

/// Opens one [`AmqpWebSocketTransport`] per connect.
pub struct AmqpWebSocketConnector {
    timeout: Duration,
}

impl AmqpWebSocketConnector {
    /// Connecting and every send attempt time out after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl TransportConnector for AmqpWebSocketConnector {
    async fn connect(
        &self,
        properties: &ConnectionProperties,
        eventhub_name: &str,
    ) -> Result<Box<dyn EventTransport>, TransportError> {
        if properties.use_development_emulator {
            return Err(TransportError::InvalidAddress(
                "the development emulator does not accept WebSocket connections; use the https transport"
                    .to_string(),
            ));
        }

        let descriptor = properties.to_connection_descriptor(eventhub_name);
        let producer = AmqpProducer::new_from_connection_string(
            descriptor.as_str(),
            eventhub_name.to_string(),
            producer_options(self.timeout),
        )
        .await
        .map_err(|err| classify_amqp_error(err.to_string()))?;

        debug!(
            "AMQP/WebSockets producer opened for {}/{}",
            properties.fully_qualified_namespace, eventhub_name
        );
        Ok(Box::new(AmqpWebSocketTransport {
            producer: Some(producer),
            eventhub_name: eventhub_name.to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publishers::event_data::DEFAULT_MAX_BATCH_BYTES;

    #[test]
    fn test_options_use_websockets_without_retries() {
        let options = producer_options(Duration::from_secs(7));
        assert!(matches!(
            options.connection_options.transport_type,
            EventHubsTransportType::AmqpWebSockets
        ));
        assert_eq!(options.retry_options.max_retries.0, 0);
        assert_eq!(options.retry_options.try_timeout, Duration::from_secs(7));
    }

    #[test]
    fn test_credential_rejections_are_access_denied() {
        let denied = [
            "amqp:unauthorized-access: InvalidSignature: The token has an invalid signature.",
            "CBS put-token failed with status code: 401",
            "Unauthorized access. 'Send' claim(s) are required",
        ];
        for message in denied {
            let err = classify_amqp_error(message.to_string());
            assert!(err.is_unauthorized(), "{}", message);
        }

        let err = classify_amqp_error("amqp:connection:forced".to_string());
        assert!(matches!(err, TransportError::Amqp(_)));
    }

    #[tokio::test]
    async fn test_emulator_strings_are_refused_before_connecting() {
        let props = ConnectionProperties::parse(
            "Endpoint=sb://localhost;SharedAccessKeyName=k;SharedAccessKey=v;UseDevelopmentEmulator=true;",
        )
        .unwrap();
        let result = AmqpWebSocketConnector::new(Duration::from_secs(1))
            .connect(&props, "hub")
            .await;
        assert!(matches!(result, Err(TransportError::InvalidAddress(_))));
    }

    #[test]
    fn test_amqp_batch_leaves_room_for_framing() {
        let mut batch = EventBatch::with_format(DEFAULT_MAX_BATCH_BYTES, AMQP_WIRE_FORMAT);
        let limit = DEFAULT_MAX_BATCH_BYTES - AMQP_BATCH_OVERHEAD - AMQP_EVENT_OVERHEAD;
        assert!(batch.try_add(EventData::new("x".repeat(limit + 1))).is_err());
        batch.try_add(EventData::new("x".repeat(limit))).unwrap();
        assert_eq!(batch.size_bytes(), DEFAULT_MAX_BATCH_BYTES);
    }
}
