//! # Event Hub Relay Cycle
//!
//! One invocation of the relay: resolve the connection secret, poll the source
//! API, publish the snapshot. The cycle carries no state between invocations;
//! the scheduler calls [`EventHubRelay::run_once`] on every tick.
//!
//! ## Key Design Principles:
//! - **Strict Sequence**: the publisher needs both the secret and the payload,
//!   so it only runs after the resolver and the fetcher have both succeeded.
//!   The resolver runs first, which means a vault outage never spends a call
//!   against the source API.
//! - **Fail Fast, No Retry**: the first failing stage aborts the cycle. The
//!   error is returned tagged with its stage and recovery is left to the next
//!   tick.
//! - **Injected Components**: the credential, resolver, fetcher and publisher
//!   are trait objects handed in by the bootstrap layer, so every stage can be
//!   replaced by a recording fake in tests.
//! - **Fresh Per Cycle**: nothing fetched or built during a cycle (token,
//!   secret, payload, producer client) outlives it.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::configs::{PublishTransport, RelaySettings};
use crate::publishers::{EventHubPublisher, EventPublisher, PublishError};
use crate::retrieve::{FetchError, HttpSourceFetcher, SourceFetcher, build_http_client};
use crate::secrets::{KeyVaultResolver, SecretResolver, SecretRetrievalError, TokenCredential};
use crate::utils::{current_utc_timestamp, redact_url, time::format_utc};

/// # Relay Stage
///
/// The step of the cycle that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStage {
    /// Reading the connection secret from the vault.
    Secret,
    /// Polling the source API.
    Fetch,
    /// Sending the event.
    Publish,
}

impl fmt::Display for RelayStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RelayStage::Secret => "secret",
            RelayStage::Fetch => "fetch",
            RelayStage::Publish => "publish",
        })
    }
}

/// # Relay Error
///
/// The failure that aborted a cycle, wrapping the component error unchanged.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The connection secret could not be resolved.
    #[error("secret retrieval failed: {0}")]
    Secret(#[from] SecretRetrievalError),

    /// The source API could not be polled.
    #[error("source fetch failed: {0}")]
    Fetch(#[from] FetchError),

    /// The event could not be published.
    #[error("publish failed: {0}")]
    Publish(#[from] PublishError),
}

impl RelayError {
    /// Which stage failed.
    pub fn stage(&self) -> RelayStage {
        match self {
            RelayError::Secret(_) => RelayStage::Secret,
            RelayError::Fetch(_) => RelayStage::Fetch,
            RelayError::Publish(_) => RelayStage::Publish,
        }
    }
}

/// # Relay Target
///
/// The four values the cycle needs from configuration: where the secret
/// lives, which secret, which event hub, and which API to poll.
#[derive(Clone, PartialEq, Eq)]
pub struct RelayTarget {
    /// Key vault endpoint.
    pub vault_url: Url,
    /// Secret holding the namespace connection string.
    pub secret_name: String,
    /// Destination event hub.
    pub eventhub_name: String,
    /// Source API URL with its key embedded.
    pub api_url: Url,
}

impl RelayTarget {
    /// Extracts the target from validated settings.
    pub fn from_settings(settings: &RelaySettings) -> Self {
        Self {
            vault_url: settings.vault_url.clone(),
            secret_name: settings.secret_name.clone(),
            eventhub_name: settings.eventhub_name.clone(),
            api_url: settings.api_url.clone(),
        }
    }
}

impl fmt::Debug for RelayTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayTarget")
            .field("vault_url", &self.vault_url.as_str())
            .field("secret_name", &self.secret_name)
            .field("eventhub_name", &self.eventhub_name)
            .field("api_url", &redact_url(self.api_url.as_str()))
            .finish()
    }
}

/// # Cycle Report
///
/// What a successful cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// UTC time the cycle started.
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration of the cycle.
    pub elapsed: Duration,
    /// Event hub that received the event.
    pub eventhub_name: String,
}

/// # Event Hub Relay
///
/// Owns the injected components and runs one cycle per call.
pub struct EventHubRelay {
    target: RelayTarget,
    credential: Arc<dyn TokenCredential>,
    resolver: Arc<dyn SecretResolver>,
    fetcher: Arc<dyn SourceFetcher>,
    publisher: Arc<dyn EventPublisher>,
}

impl EventHubRelay {
    /// Assembles a relay from explicit components.
    pub fn new(
        target: RelayTarget,
        credential: Arc<dyn TokenCredential>,
        resolver: Arc<dyn SecretResolver>,
        fetcher: Arc<dyn SourceFetcher>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            target,
            credential,
            resolver,
            fetcher,
            publisher,
        }
    }

    /// The production wiring: key vault resolver and source fetcher over a
    /// shared HTTP client, and an event hub publisher on `settings.transport`,
    /// all bounded by `settings.http_timeout`.
    pub fn from_settings(
        settings: &RelaySettings,
        credential: Arc<dyn TokenCredential>,
    ) -> Result<Self, reqwest::Error> {
        let client = build_http_client(settings.http_timeout)?;
        let publisher = match settings.transport {
            PublishTransport::AmqpWebsockets => {
                EventHubPublisher::amqp_websockets(settings.http_timeout)
            }
            PublishTransport::Https => EventHubPublisher::https(settings.http_timeout),
        };
        Ok(Self::new(
            RelayTarget::from_settings(settings),
            credential,
            Arc::new(KeyVaultResolver::new(client.clone())),
            Arc::new(HttpSourceFetcher::new(client)),
            Arc::new(publisher),
        ))
    }

    /// The configured target.
    pub fn target(&self) -> &RelayTarget {
        &self.target
    }

    /// # Run Once
    ///
    /// Executes one cycle.
    ///
    /// ## Workflow:
    /// 1.  **Resolve**: reads the connection secret, authenticating with the
    ///     injected credential.
    /// 2.  **Fetch**: polls the source API once.
    /// 3.  **Publish**: sends the payload as a single event to the target hub.
    ///
    /// The first failure returns immediately; later stages are not attempted
    /// and nothing is published.
    pub async fn run_once(&self) -> Result<CycleReport, RelayError> {
        let started_at = current_utc_timestamp();
        let clock = Instant::now();
        debug!("Relay cycle started at {}", format_utc(&started_at));

        // --- Phase 1: Secret ---
        let secret = self
            .resolver
            .resolve(
                &self.target.vault_url,
                &self.target.secret_name,
                self.credential.as_ref(),
            )
            .await?;

        // --- Phase 2: Source ---
        let payload = self.fetcher.fetch(&self.target.api_url).await?;

        // --- Phase 3: Publish ---
        self.publisher
            .publish(&secret, &self.target.eventhub_name, &payload)
            .await?;

        let elapsed = clock.elapsed();
        info!(
            "Relay cycle executed: event published to '{}' in {} ms",
            self.target.eventhub_name,
            elapsed.as_millis()
        );

        Ok(CycleReport {
            started_at,
            elapsed,
            eventhub_name: self.target.eventhub_name.clone(),
        })
    }
}
