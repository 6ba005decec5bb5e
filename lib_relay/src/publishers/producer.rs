//! # Event Hub Producer
//!
//! The publish client and the transport it drives.
//!
//! [`EventHubProducerClient`] is built per publish from a connection
//! descriptor, owns exactly one [`EventTransport`], and must be released with
//! [`EventHubProducerClient::close`]. Transports are created by a
//! [`TransportConnector`]. The default production connector tunnels AMQP
//! over a WebSocket (see [`super::amqp_websocket`]); [`HttpsConnector`] here
//! posts batches to the namespace REST endpoint instead, which is what the
//! local development emulator needs. Both only use port 443.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use super::connection_string::{ConnectionDescriptor, ConnectionProperties, SasCredential};
use super::event_data::{DEFAULT_MAX_BATCH_BYTES, EventBatch, EventData, WireFormat};
use super::eventhub::PublishError;
use super::sas_token::{DEFAULT_TOKEN_LIFETIME, SasError, expiry_from, generate_sas_token};
use crate::utils::{USER_AGENT, current_utc_timestamp};

/// REST API version for batch sends.
pub const EVENTHUB_API_VERSION: &str = "2014-01";

/// Content type of a JSON batch send.
pub const BATCH_CONTENT_TYPE: &str = "application/vnd.microsoft.servicebus.json";

/// Server-side operation timeout requested on every send, in seconds.
const SEND_TIMEOUT_SECS: u32 = 60;

/// `[` and `]`, less the separator the first message does not need.
const REST_BATCH_OVERHEAD: usize = 1;

/// `{"Body":""}` plus one `,` separator.
const REST_MESSAGE_FRAME: usize = 12;

/// Framing of a REST batch: a JSON array of `{"Body":"<escaped body>"}`.
pub const REST_WIRE_FORMAT: WireFormat = WireFormat {
    batch_overhead: REST_BATCH_OVERHEAD,
    event_size: rest_event_size,
};

fn rest_event_size(event: &EventData) -> usize {
    REST_MESSAGE_FRAME + json_escaped_len(event.body())
}

/// Length of `text` once written as a JSON string body by `serde_json`.
fn json_escaped_len(text: &str) -> usize {
    text.chars()
        .map(|ch| match ch {
            '"' | '\\' | '\n' | '\r' | '\t' | '\u{08}' | '\u{0c}' => 2,
            ch if (ch as u32) < 0x20 => 6,
            ch => ch.len_utf8(),
        })
        .sum()
}

/// Failures below the publish client.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The namespace or event hub do not form a valid address.
    #[error("invalid event hub address: {0}")]
    InvalidAddress(String),

    /// The service rejected the credentials (401/403).
    #[error("event hub refused the credentials: HTTP {status}: {body}")]
    Unauthorized {
        /// HTTP status.
        status: u16,
        /// Response body.
        body: String,
    },

    /// Any other non-success answer.
    #[error("event hub rejected the batch: HTTP {status}: {body}")]
    Rejected {
        /// HTTP status.
        status: u16,
        /// Response body.
        body: String,
    },

    /// The request never produced a response.
    #[error("event hub request failed: {0}")]
    Request(#[source] reqwest::Error),

    /// A token could not be signed.
    #[error(transparent)]
    Signing(#[from] SasError),

    /// The batch could not be written to the wire format.
    #[error("failed to serialize batch: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The AMQP link refused the credentials (`amqp:unauthorized-access`).
    #[error("event hub denied access: {0}")]
    AccessDenied(String),

    /// Any other AMQP failure.
    #[error("AMQP transport error: {0}")]
    Amqp(String),

    /// The transport was already closed.
    #[error("transport is closed")]
    Closed,
}

impl TransportError {
    /// True when the service rejected the credentials.
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            TransportError::Unauthorized { .. } | TransportError::AccessDenied(_)
        )
    }
}

/// An open channel to one event hub.
#[async_trait]
pub trait EventTransport: Send {
    /// Submits every event of `batch`, in order.
    async fn send(&mut self, batch: &EventBatch) -> Result<(), TransportError>;

    /// Releases the channel. Later sends fail with [`TransportError::Closed`].
    async fn close(&mut self) -> Result<(), TransportError>;

    /// How events are framed on the wire, used to size batches.
    fn wire_format(&self) -> WireFormat {
        WireFormat::RAW
    }
}

/// Opens transports.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Opens a channel to `eventhub_name` in the namespace of `properties`.
    async fn connect(
        &self,
        properties: &ConnectionProperties,
        eventhub_name: &str,
    ) -> Result<Box<dyn EventTransport>, TransportError>;
}

#[derive(Serialize)]
struct WireMessage<'a> {
    #[serde(rename = "Body")]
    body: &'a str,
}

/// [`EventTransport`] over the namespace REST endpoint.
pub struct HttpsTransport {
    client: Option<Client>,
    messages_url: Url,
    resource_uri: String,
    credential: SasCredential,
}

impl HttpsTransport {
    /// Binds `client` to `eventhub_name`. `http` is used only when the
    /// connection string targets the development emulator.
    pub fn new(
        client: Client,
        properties: &ConnectionProperties,
        eventhub_name: &str,
    ) -> Result<Self, TransportError> {
        let scheme = if properties.use_development_emulator { "http" } else { "https" };
        let base = format!("{}://{}/", scheme, properties.fully_qualified_namespace);

        let mut messages_url =
            Url::parse(&base).map_err(|err| TransportError::InvalidAddress(err.to_string()))?;
        messages_url
            .path_segments_mut()
            .map_err(|_| TransportError::InvalidAddress(base.clone()))?
            .pop_if_empty()
            .push(eventhub_name)
            .push("messages");
        messages_url
            .query_pairs_mut()
            .append_pair("timeout", &SEND_TIMEOUT_SECS.to_string())
            .append_pair("api-version", EVENTHUB_API_VERSION);

        let resource_uri = format!("{}{}", base, eventhub_name);

        Ok(Self {
            client: Some(client),
            messages_url,
            resource_uri,
            credential: properties.credential.clone(),
        })
    }

    /// Where batches are posted.
    pub fn messages_url(&self) -> &Url {
        &self.messages_url
    }

    fn authorization(&self) -> Result<String, TransportError> {
        match &self.credential {
            SasCredential::Signature(token) => Ok(token.clone()),
            SasCredential::Key { name, key } => {
                let expiry = expiry_from(current_utc_timestamp().timestamp(), DEFAULT_TOKEN_LIFETIME);
                Ok(generate_sas_token(&self.resource_uri, name, key, expiry)?)
            }
        }
    }
}

#[async_trait]
impl EventTransport for HttpsTransport {
    async fn send(&mut self, batch: &EventBatch) -> Result<(), TransportError> {
        let client = self.client.as_ref().ok_or(TransportError::Closed)?;
        if batch.is_empty() {
            debug!("Skipping send of an empty batch");
            return Ok(());
        }

        let messages: Vec<WireMessage<'_>> = batch
            .events()
            .iter()
            .map(|event| WireMessage { body: event.body() })
            .collect();
        let body = serde_json::to_string(&messages)?;

        let response = client
            .post(self.messages_url.clone())
            .header(reqwest::header::AUTHORIZATION, self.authorization()?)
            .header(reqwest::header::CONTENT_TYPE, BATCH_CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .map_err(TransportError::Request)?;

        let status = response.status();
        if status.is_success() {
            debug!("Batch of {} event(s) accepted with {}", batch.len(), status);
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => TransportError::Unauthorized {
                status: status.as_u16(),
                body,
            },
            _ => TransportError::Rejected {
                status: status.as_u16(),
                body,
            },
        })
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // Dropping the client tears down its pooled connections.
        self.client.take();
        Ok(())
    }

    fn wire_format(&self) -> WireFormat {
        REST_WIRE_FORMAT
    }
}

/// Builds a fresh [`HttpsTransport`], with its own HTTP client, per connect.
pub struct HttpsConnector {
    timeout: Duration,
}

impl HttpsConnector {
    /// Requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl TransportConnector for HttpsConnector {
    async fn connect(
        &self,
        properties: &ConnectionProperties,
        eventhub_name: &str,
    ) -> Result<Box<dyn EventTransport>, TransportError> {
        let client = Client::builder()
            .timeout(self.timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(TransportError::Request)?;
        Ok(Box::new(HttpsTransport::new(client, properties, eventhub_name)?))
    }
}

/// Publish client bound to one connection descriptor and one event hub.
pub struct EventHubProducerClient {
    eventhub_name: String,
    fully_qualified_namespace: String,
    transport: Option<Box<dyn EventTransport>>,
}

impl EventHubProducerClient {
    /// Parses `descriptor`, checks it against `eventhub_name` and opens a
    /// transport through `connector`.
    pub async fn from_connection_string(
        descriptor: &ConnectionDescriptor,
        eventhub_name: &str,
        connector: &dyn TransportConnector,
    ) -> Result<Self, PublishError> {
        let properties = ConnectionProperties::parse(descriptor.as_str())?;
        let eventhub_name = properties.resolve_eventhub(eventhub_name)?.to_string();

        let transport = connector
            .connect(&properties, &eventhub_name)
            .await
            .map_err(PublishError::from_transport)?;

        debug!(
            "Producer client opened for {}/{}",
            properties.fully_qualified_namespace, eventhub_name
        );

        Ok(Self {
            eventhub_name,
            fully_qualified_namespace: properties.fully_qualified_namespace,
            transport: Some(transport),
        })
    }

    /// Target event hub.
    pub fn eventhub_name(&self) -> &str {
        &self.eventhub_name
    }

    /// Namespace host.
    pub fn fully_qualified_namespace(&self) -> &str {
        &self.fully_qualified_namespace
    }

    /// An empty batch sized for this hub, measured the way the transport
    /// frames it.
    pub fn create_batch(&self) -> EventBatch {
        let format = self
            .transport
            .as_ref()
            .map_or(WireFormat::RAW, |transport| transport.wire_format());
        EventBatch::with_format(DEFAULT_MAX_BATCH_BYTES, format)
    }

    /// Submits `batch`. Not retried.
    pub async fn send_batch(&mut self, batch: &EventBatch) -> Result<(), PublishError> {
        let transport = self
            .transport
            .as_mut()
            .ok_or(PublishError::Transport(TransportError::Closed))?;
        transport.send(batch).await.map_err(PublishError::from_transport)
    }

    /// Releases the transport.
    pub async fn close(mut self) -> Result<(), PublishError> {
        match self.transport.take() {
            Some(mut transport) => transport.close().await.map_err(PublishError::from_transport),
            None => Ok(()),
        }
    }
}

impl Drop for EventHubProducerClient {
    fn drop(&mut self) {
        if self.transport.is_some() {
            warn!(
                "Producer client for {}/{} dropped without close; releasing transport",
                self.fully_qualified_namespace, self.eventhub_name
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publishers::connection_string::build_connection_descriptor;
    use crate::publishers::event_data::EventData;
    use crate::secrets::SecretValue;
    use crate::test_support::{MockResponse, serve};

    fn emulator_properties(base_url: &str) -> ConnectionProperties {
        let host = base_url.trim_start_matches("http://");
        ConnectionProperties::parse(&format!(
            "Endpoint=sb://{}/;SharedAccessKeyName=k;SharedAccessKey=v;UseDevelopmentEmulator=true;EntityPath=weatherdata",
            host
        ))
        .unwrap()
    }

    fn single_batch(body: &str) -> EventBatch {
        let mut batch = EventBatch::new(DEFAULT_MAX_BATCH_BYTES);
        batch.try_add(EventData::new(body)).unwrap();
        batch
    }

    #[test]
    fn test_https_address_layout() {
        let props = ConnectionProperties::parse(
            "Endpoint=sb://ns.servicebus.windows.net/;SharedAccessKeyName=k;SharedAccessKey=v;",
        )
        .unwrap();
        let transport = HttpsTransport::new(Client::new(), &props, "weatherdata").unwrap();
        assert_eq!(
            transport.messages_url().as_str(),
            "https://ns.servicebus.windows.net/weatherdata/messages?timeout=60&api-version=2014-01"
        );
        assert_eq!(transport.resource_uri, "https://ns.servicebus.windows.net/weatherdata");
    }

    #[test]
    fn test_rest_wire_format_matches_serialized_batch() {
        let bodies = [
            r#"{"temp": 72, "unit": "F"}"#,
            r#"["a", "b\\c", "\u00fc"]"#,
            "line\nbreak\ttab\u{1}bell\u{8}\u{c}",
            "",
        ];
        let mut batch = EventBatch::with_format(DEFAULT_MAX_BATCH_BYTES, REST_WIRE_FORMAT);
        for body in bodies {
            batch.try_add(EventData::new(body)).unwrap();
        }

        let messages: Vec<WireMessage<'_>> = batch
            .events()
            .iter()
            .map(|event| WireMessage { body: event.body() })
            .collect();
        assert_eq!(batch.size_bytes(), serde_json::to_string(&messages).unwrap().len());

        let single = EventBatch::with_format(DEFAULT_MAX_BATCH_BYTES, REST_WIRE_FORMAT);
        let event = EventData::new(r#"{"a": "\"q\""}"#);
        let wire = serde_json::to_string(&[WireMessage { body: event.body() }]).unwrap();
        assert_eq!(single.size_with(&event), wire.len());
    }

    #[test]
    fn test_https_transport_sizes_batches_by_wire_format() {
        let props = emulator_properties("http://127.0.0.1:9");
        let transport = HttpsTransport::new(Client::new(), &props, "weatherdata").unwrap();
        let format = transport.wire_format();
        assert_eq!(format.batch_overhead, REST_BATCH_OVERHEAD);
        assert_eq!((format.event_size)(&EventData::new("\"")), REST_MESSAGE_FRAME + 2);
    }

    #[test]
    fn test_unauthorized_classification() {
        assert!(TransportError::AccessDenied("amqp:unauthorized-access".into()).is_unauthorized());
        assert!(TransportError::Unauthorized { status: 401, body: String::new() }.is_unauthorized());
        assert!(!TransportError::Amqp("link detached".into()).is_unauthorized());
        assert!(!TransportError::Closed.is_unauthorized());
    }

    #[tokio::test]
    async fn test_send_posts_signed_json_batch() {
        let server = serve(vec![MockResponse::text(201, "")]).await;
        let props = emulator_properties(&server.base_url);
        let mut transport = HttpsConnector::new(Duration::from_secs(5))
            .connect(&props, "weatherdata")
            .await
            .unwrap();

        transport.send(&single_batch(r#"{"temp": 72, "unit": "F"}"#)).await.unwrap();
        transport.close().await.unwrap();

        let requests = server.finish().await;
        let request = &requests[0];
        assert_eq!(request.method, "POST");
        assert_eq!(
            request.target,
            "/weatherdata/messages?timeout=60&api-version=2014-01"
        );
        assert_eq!(request.header("content-type"), Some(BATCH_CONTENT_TYPE));
        let auth = request.header("authorization").unwrap_or_default();
        assert!(auth.starts_with("SharedAccessSignature sr=http%3A%2F%2F127.0.0.1"));
        assert!(auth.ends_with("&skn=k"));
        assert_eq!(request.body, r#"[{"Body":"{\"temp\": 72, \"unit\": \"F\"}"}]"#);
    }

    #[tokio::test]
    async fn test_send_classifies_statuses() {
        let server = serve(vec![
            MockResponse::text(401, "InvalidSignature"),
            MockResponse::text(403, "Unauthorized"),
            MockResponse::text(503, "ServerBusy"),
        ])
        .await;
        let props = emulator_properties(&server.base_url);
        let mut transport = HttpsConnector::new(Duration::from_secs(5))
            .connect(&props, "weatherdata")
            .await
            .unwrap();
        let batch = single_batch("{}");

        let err = transport.send(&batch).await.unwrap_err();
        assert!(matches!(err, TransportError::Unauthorized { status: 401, .. }));
        let err = transport.send(&batch).await.unwrap_err();
        assert!(matches!(err, TransportError::Unauthorized { status: 403, .. }));
        let err = transport.send(&batch).await.unwrap_err();
        assert!(matches!(err, TransportError::Rejected { status: 503, .. }));

        server.finish().await;
    }

    #[tokio::test]
    async fn test_closed_transport_refuses_sends() {
        let props = emulator_properties("http://127.0.0.1:9");
        let mut transport = HttpsTransport::new(Client::new(), &props, "weatherdata").unwrap();
        transport.close().await.unwrap();
        let err = transport.send(&single_batch("{}")).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn test_pre_issued_signature_is_sent_verbatim() {
        let server = serve(vec![MockResponse::text(201, "")]).await;
        let host = server.base_url.trim_start_matches("http://").to_string();
        let secret = SecretValue::new(format!(
            "Endpoint=sb://{}/;SharedAccessSignature=SharedAccessSignature sr=a&sig=b&se=1&skn=c;UseDevelopmentEmulator=true;",
            host
        ))
        .unwrap();
        let descriptor = build_connection_descriptor(&secret, "weatherdata").unwrap();

        let connector = HttpsConnector::new(Duration::from_secs(5));
        let mut client = EventHubProducerClient::from_connection_string(&descriptor, "weatherdata", &connector)
            .await
            .unwrap();
        assert_eq!(client.eventhub_name(), "weatherdata");
        assert_eq!(client.fully_qualified_namespace(), host);

        let batch = single_batch("1");
        client.send_batch(&batch).await.unwrap();
        client.close().await.unwrap();

        let requests = server.finish().await;
        assert_eq!(
            requests[0].header("authorization"),
            Some("SharedAccessSignature sr=a&sig=b&se=1&skn=c")
        );
    }

    #[tokio::test]
    async fn test_client_rejects_mismatched_entity_path() {
        let secret = SecretValue::new(
            "Endpoint=sb://ns.servicebus.windows.net/;SharedAccessKeyName=k;SharedAccessKey=v;",
        )
        .unwrap();
        let descriptor = build_connection_descriptor(&secret, "weatherdata").unwrap();
        let connector = HttpsConnector::new(Duration::from_secs(5));

        let result = EventHubProducerClient::from_connection_string(&descriptor, "other", &connector).await;
        assert!(matches!(result, Err(PublishError::InvalidDescriptor(_))));
    }
}
