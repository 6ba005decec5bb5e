//! # Source Fetcher
//!
//! Performs one `GET` against the configured API URL and decodes the body as
//! JSON. The URL arrives fully formed, API key included, so it is only ever
//! logged through [`redact_url`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::utils::{USER_AGENT, redact_url};

/// Errors from a single poll of the source API.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The request never produced a response (DNS, TLS, timeout, reset).
    #[error("source API request failed: {0}")]
    Request(#[source] reqwest::Error),

    /// The API answered with anything other than `200 OK`.
    #[error("source API returned HTTP {status}: {body}")]
    Http {
        /// Numeric status code.
        status: u16,
        /// Raw response body, for diagnostics.
        body: String,
    },

    /// A `200 OK` whose body is not JSON.
    #[error("source API returned a body that is not valid JSON ({body_len} bytes): {source}")]
    Decode {
        /// The decoder error.
        #[source]
        source: serde_json::Error,
        /// Size of the rejected body.
        body_len: usize,
    },
}

impl FetchError {
    /// The HTTP status for [`FetchError::Http`], if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Fetches one JSON document from a URL.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Issues a single `GET` and returns the decoded body.
    async fn fetch(&self, api_url: &Url) -> Result<Value, FetchError>;
}

/// Builds the shared outbound client: request timeout plus the relay's user agent.
pub fn build_http_client(timeout: Duration) -> reqwest::Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
}

/// [`SourceFetcher`] backed by `reqwest`.
pub struct HttpSourceFetcher {
    client: Client,
}

impl HttpSourceFetcher {
    /// Uses `client` for every poll.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SourceFetcher for HttpSourceFetcher {
    async fn fetch(&self, api_url: &Url) -> Result<Value, FetchError> {
        let safe_url = redact_url(api_url.as_str());
        debug!("Polling source API {}", safe_url);

        let response = self
            .client
            .get(api_url.clone())
            .send()
            .await
            .map_err(|err| FetchError::Request(err.without_url()))?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|err| FetchError::Request(err.without_url()))?;
        let data: Value = serde_json::from_str(&body).map_err(|source| FetchError::Decode {
            source,
            body_len: body.len(),
        })?;

        info!("Data retrieved successfully from {} ({} bytes)", safe_url, body.len());
        Ok(data)
    }
}
