//! End-to-end behaviour of one relay cycle with every external call replaced
//! by a recording fake.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};
use url::Url;

use lib_relay::ingestors::{EventHubRelay, RelayError, RelayStage, RelayTarget};
use lib_relay::publishers::{
    ConnectionProperties, EventBatch, EventHubPublisher, EventPublisher, EventTransport,
    PublishError, TransportConnector, TransportError, encode_payload,
};
use lib_relay::retrieve::{FetchError, SourceFetcher};
use lib_relay::secrets::{
    AccessToken, CredentialError, KEY_VAULT_SCOPE, SecretResolver, SecretRetrievalError,
    SecretValue, TokenCredential,
};

type Journal = Arc<Mutex<Vec<String>>>;

fn note(journal: &Journal, entry: impl Into<String>) {
    journal.lock().unwrap().push(entry.into());
}

fn entries(journal: &Journal) -> Vec<String> {
    journal.lock().unwrap().clone()
}

fn namespace_secret(key: &str) -> String {
    format!(
        "Endpoint=sb://ns.servicebus.windows.net/;SharedAccessKeyName=k;SharedAccessKey={};",
        key
    )
}

struct CountingCredential {
    journal: Journal,
}

#[async_trait]
impl TokenCredential for CountingCredential {
    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError> {
        note(&self.journal, format!("token:{}", scope));
        Ok(AccessToken {
            token: "kv-token".to_string(),
            expires_on: None,
        })
    }

    fn name(&self) -> &'static str {
        "CountingCredential"
    }
}

/// Serves queued secrets, asking the credential for a token on every call.
struct QueuedResolver {
    journal: Journal,
    answers: Mutex<VecDeque<Result<String, ()>>>,
}

#[async_trait]
impl SecretResolver for QueuedResolver {
    async fn resolve(
        &self,
        store_endpoint: &Url,
        secret_name: &str,
        credential: &dyn TokenCredential,
    ) -> Result<SecretValue, SecretRetrievalError> {
        note(
            &self.journal,
            format!("resolve:{}:{}", store_endpoint.host_str().unwrap_or_default(), secret_name),
        );
        credential.get_token(KEY_VAULT_SCOPE).await?;
        match self.answers.lock().unwrap().pop_front() {
            Some(Ok(raw)) => Ok(SecretValue::new(raw).unwrap()),
            _ => Err(SecretRetrievalError::NotFound(secret_name.to_string())),
        }
    }
}

struct QueuedFetcher {
    journal: Journal,
    answers: Mutex<VecDeque<Result<Value, u16>>>,
}

#[async_trait]
impl SourceFetcher for QueuedFetcher {
    async fn fetch(&self, api_url: &Url) -> Result<Value, FetchError> {
        note(&self.journal, format!("fetch:{}", api_url.path()));
        match self.answers.lock().unwrap().pop_front() {
            Some(Ok(value)) => Ok(value),
            Some(Err(status)) => Err(FetchError::Http {
                status,
                body: "upstream error".to_string(),
            }),
            None => panic!("fetch called more often than expected"),
        }
    }
}

/// Transport connector recording connects, sent bodies and closes. With
/// `reject` set, every send fails with 401.
struct RecordingConnector {
    journal: Journal,
    reject: bool,
}

struct RecordingTransport {
    journal: Journal,
    reject: bool,
}

#[async_trait]
impl TransportConnector for RecordingConnector {
    async fn connect(
        &self,
        properties: &ConnectionProperties,
        eventhub_name: &str,
    ) -> Result<Box<dyn EventTransport>, TransportError> {
        note(
            &self.journal,
            format!("connect:{}/{}", properties.fully_qualified_namespace, eventhub_name),
        );
        Ok(Box::new(RecordingTransport {
            journal: self.journal.clone(),
            reject: self.reject,
        }))
    }
}

#[async_trait]
impl EventTransport for RecordingTransport {
    async fn send(&mut self, batch: &EventBatch) -> Result<(), TransportError> {
        for event in batch.events() {
            note(&self.journal, format!("send:{}", event.body()));
        }
        if self.reject {
            return Err(TransportError::Unauthorized {
                status: 401,
                body: "InvalidSignature: The token has an invalid signature.".to_string(),
            });
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        note(&self.journal, "close");
        Ok(())
    }
}

/// Publisher that only records what it was asked to send.
struct RecordingPublisher {
    journal: Journal,
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(
        &self,
        secret: &SecretValue,
        routing_name: &str,
        payload: &Value,
    ) -> Result<(), PublishError> {
        note(
            &self.journal,
            format!("publish:{}:{}:{}", secret.expose(), routing_name, encode_payload(payload)?),
        );
        Ok(())
    }
}

fn target() -> RelayTarget {
    RelayTarget {
        vault_url: Url::parse("https://my-vault.vault.azure.net").unwrap(),
        secret_name: "eh-conn".to_string(),
        eventhub_name: "weatherdata".to_string(),
        api_url: Url::parse("https://api.example.com/weather?appid=k3y").unwrap(),
    }
}

struct Harness {
    journal: Journal,
    relay: EventHubRelay,
}

fn harness(
    secrets: Vec<Result<String, ()>>,
    payloads: Vec<Result<Value, u16>>,
    publisher: impl FnOnce(Journal) -> Arc<dyn EventPublisher>,
) -> Harness {
    let journal: Journal = Arc::new(Mutex::new(Vec::new()));
    let relay = EventHubRelay::new(
        target(),
        Arc::new(CountingCredential {
            journal: journal.clone(),
        }),
        Arc::new(QueuedResolver {
            journal: journal.clone(),
            answers: Mutex::new(secrets.into()),
        }),
        Arc::new(QueuedFetcher {
            journal: journal.clone(),
            answers: Mutex::new(payloads.into()),
        }),
        publisher(journal.clone()),
    );
    Harness { journal, relay }
}

fn eventhub_publisher(reject: bool) -> impl FnOnce(Journal) -> Arc<dyn EventPublisher> {
    move |journal: Journal| -> Arc<dyn EventPublisher> {
        Arc::new(EventHubPublisher::new(Arc::new(RecordingConnector {
            journal,
            reject,
        })))
    }
}

fn recording_publisher(journal: Journal) -> Arc<dyn EventPublisher> {
    Arc::new(RecordingPublisher { journal })
}

fn sends(journal: &Journal) -> Vec<String> {
    entries(journal)
        .into_iter()
        .filter(|e| e.starts_with("send:") || e.starts_with("publish:"))
        .collect()
}

#[tokio::test]
async fn successful_cycle_sends_exactly_one_encoded_message() {
    let payload: Value = serde_json::from_str(r#"{"temp": 72, "unit": "F"}"#).unwrap();
    let h = harness(
        vec![Ok(namespace_secret("v"))],
        vec![Ok(payload)],
        eventhub_publisher(false),
    );

    let report = h.relay.run_once().await.unwrap();
    assert_eq!(report.eventhub_name, "weatherdata");

    assert_eq!(
        entries(&h.journal),
        vec![
            "resolve:my-vault.vault.azure.net:eh-conn",
            "token:https://vault.azure.net/.default",
            "fetch:/weather",
            "connect:ns.servicebus.windows.net/weatherdata",
            r#"send:{"temp": 72, "unit": "F"}"#,
            "close",
        ]
    );
}

#[tokio::test]
async fn message_body_is_the_json_encoding_of_the_payload() {
    let payloads = vec![
        json!([{"city": "Zürich", "readings": [1.5, -3, null]}]),
        json!({"nested": {"ok": true}, "list": []}),
    ];
    for payload in payloads {
        let expected = encode_payload(&payload).unwrap();
        let h = harness(
            vec![Ok(namespace_secret("v"))],
            vec![Ok(payload.clone())],
            eventhub_publisher(false),
        );

        h.relay.run_once().await.unwrap();

        let sent = sends(&h.journal);
        assert_eq!(sent, vec![format!("send:{}", expected)]);
        let body: Value = serde_json::from_str(sent[0].trim_start_matches("send:")).unwrap();
        assert_eq!(body, payload);
    }
}

#[tokio::test]
async fn secret_failure_skips_fetch_and_publish() {
    let h = harness(vec![Err(())], vec![], recording_publisher);

    let err = h.relay.run_once().await.unwrap_err();

    assert_eq!(err.stage(), RelayStage::Secret);
    assert!(matches!(err, RelayError::Secret(SecretRetrievalError::NotFound(_))));
    assert!(!entries(&h.journal).iter().any(|e| e.starts_with("fetch:")));
    assert!(sends(&h.journal).is_empty());
}

#[tokio::test]
async fn source_http_500_fails_without_publishing() {
    let h = harness(
        vec![Ok(namespace_secret("v"))],
        vec![Err(500)],
        eventhub_publisher(false),
    );

    let err = h.relay.run_once().await.unwrap_err();

    assert_eq!(err.stage(), RelayStage::Fetch);
    assert!(matches!(
        err,
        RelayError::Fetch(FetchError::Http { status: 500, .. })
    ));
    let journal = entries(&h.journal);
    assert!(!journal.iter().any(|e| e.starts_with("connect:")));
    assert!(sends(&h.journal).is_empty());
}

#[tokio::test]
async fn rejected_key_raises_authentication_error_without_retry() {
    let h = harness(
        vec![Ok(namespace_secret("wrong"))],
        vec![Ok(json!({"temp": 72}))],
        eventhub_publisher(true),
    );

    let err = h.relay.run_once().await.unwrap_err();

    assert_eq!(err.stage(), RelayStage::Publish);
    match &err {
        RelayError::Publish(publish) => {
            assert!(publish.is_authentication());
            assert!(publish.to_string().contains("SharedAccessKeyName=<KEY_NAME>"));
        }
        other => panic!("unexpected error: {other}"),
    }
    let journal = entries(&h.journal);
    assert_eq!(sends(&h.journal).len(), 1, "exactly one attempt");
    assert_eq!(journal.last().map(String::as_str), Some("close"));
}

#[tokio::test]
async fn secret_with_entity_path_is_rejected_before_connecting() {
    let h = harness(
        vec![Ok(format!("{}EntityPath=other", namespace_secret("v")))],
        vec![Ok(json!({}))],
        eventhub_publisher(false),
    );

    let err = h.relay.run_once().await.unwrap_err();

    assert!(matches!(err, RelayError::Publish(PublishError::InvalidDescriptor(_))));
    assert!(!entries(&h.journal).iter().any(|e| e.starts_with("connect:")));
}

#[tokio::test]
async fn consecutive_cycles_repeat_every_call() {
    let h = harness(
        vec![Ok(namespace_secret("v1")), Ok(namespace_secret("v2"))],
        vec![Ok(json!({"n": 1})), Ok(json!({"n": 2}))],
        recording_publisher,
    );

    h.relay.run_once().await.unwrap();
    h.relay.run_once().await.unwrap();

    let journal = entries(&h.journal);
    let count = |prefix: &str| journal.iter().filter(|e| e.starts_with(prefix)).count();
    assert_eq!(count("token:"), 2, "a token is requested in every cycle");
    assert_eq!(count("resolve:"), 2);
    assert_eq!(count("fetch:"), 2);
    assert_eq!(
        sends(&h.journal),
        vec![
            format!("publish:{}:weatherdata:{{\"n\": 1}}", namespace_secret("v1")),
            format!("publish:{}:weatherdata:{{\"n\": 2}}", namespace_secret("v2")),
        ]
    );
}

#[tokio::test]
async fn failed_cycle_does_not_poison_the_next_one() {
    let h = harness(
        vec![Ok(namespace_secret("v")), Ok(namespace_secret("v"))],
        vec![Err(503), Ok(json!({"recovered": true}))],
        eventhub_publisher(false),
    );

    assert!(h.relay.run_once().await.is_err());
    h.relay.run_once().await.unwrap();

    assert_eq!(sends(&h.journal), vec![r#"send:{"recovered": true}"#]);
}
