//! # Key Vault Secret Resolver
//!
//! Reads the current value of one named secret over the key vault REST API.
//! One authenticated `GET` per call; nothing is cached or persisted, and any
//! failure is fatal to the invocation.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;
use url::{Host, Url};

use super::credential::{CredentialError, KEY_VAULT_SCOPE, TokenCredential};
use super::secret_value::SecretValue;

/// Data-plane API version for secret reads.
pub const SECRETS_API_VERSION: &str = "7.4";

const MAX_SECRET_NAME_LEN: usize = 127;

/// Why a secret could not be resolved. Every variant aborts the invocation.
#[derive(Debug, Error)]
pub enum SecretRetrievalError {
    /// The store endpoint is not an absolute `https` URL.
    #[error("invalid secret store endpoint '{endpoint}': {reason}")]
    InvalidEndpoint {
        /// The offending endpoint.
        endpoint: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The secret name breaks the store's naming rules.
    #[error("invalid secret name '{0}': expected 1-127 characters of [0-9A-Za-z-]")]
    InvalidName(String),

    /// No token could be obtained for the store.
    #[error("failed to authenticate to the secret store: {0}")]
    Credential(#[from] CredentialError),

    /// The store could not be reached.
    #[error("secret store request failed: {0}")]
    Request(#[source] reqwest::Error),

    /// The identity is not allowed to read the secret.
    #[error("secret store denied access to '{name}': {status} {body}")]
    Unauthorized {
        /// Secret name.
        name: String,
        /// HTTP status.
        status: u16,
        /// Response body.
        body: String,
    },

    /// The secret does not exist.
    #[error("secret '{0}' was not found in the secret store")]
    NotFound(String),

    /// Any other non-success answer.
    #[error("secret store returned {status} for '{name}': {body}")]
    Status {
        /// Secret name.
        name: String,
        /// HTTP status.
        status: u16,
        /// Response body.
        body: String,
    },

    /// The secret bundle could not be decoded.
    #[error("failed to parse secret bundle for '{name}': {reason}")]
    Parse {
        /// Secret name.
        name: String,
        /// Decoder message.
        reason: String,
    },

    /// The secret exists but holds no value.
    #[error("secret '{0}' has an empty value")]
    EmptyValue(String),
}

/// Resolves a named secret from a secret store.
#[async_trait]
pub trait SecretResolver: Send + Sync {
    /// Authenticates with `credential` and returns the current value of
    /// `secret_name` from the store at `store_endpoint`.
    async fn resolve(
        &self,
        store_endpoint: &Url,
        secret_name: &str,
        credential: &dyn TokenCredential,
    ) -> Result<SecretValue, SecretRetrievalError>;
}

fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

fn validate_endpoint(endpoint: &Url) -> Result<(), SecretRetrievalError> {
    let reject = |reason: &str| SecretRetrievalError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason: reason.to_string(),
    };

    if endpoint.host().is_none() {
        return Err(reject("missing host"));
    }
    match endpoint.scheme() {
        "https" => Ok(()),
        // Local emulators only.
        "http" if is_loopback(endpoint) => Ok(()),
        _ => Err(reject("scheme must be https")),
    }
}

fn validate_name(name: &str) -> Result<(), SecretRetrievalError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_SECRET_NAME_LEN
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(SecretRetrievalError::InvalidName(name.to_string()))
    }
}

#[derive(Deserialize)]
struct SecretBundle {
    #[serde(default)]
    value: Option<String>,
}

/// [`SecretResolver`] over the key vault REST API.
pub struct KeyVaultResolver {
    client: Client,
}

impl KeyVaultResolver {
    /// Uses `client` for every request.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// `<store>/secrets/<name>?api-version=7.4`
    pub fn secret_url(store_endpoint: &Url, secret_name: &str) -> Result<Url, SecretRetrievalError> {
        let mut url = store_endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| SecretRetrievalError::InvalidEndpoint {
                endpoint: store_endpoint.to_string(),
                reason: "endpoint cannot be a base".to_string(),
            })?
            .pop_if_empty()
            .push("secrets")
            .push(secret_name);
        url.query_pairs_mut()
            .append_pair("api-version", SECRETS_API_VERSION);
        Ok(url)
    }
}

#[async_trait]
impl SecretResolver for KeyVaultResolver {
    async fn resolve(
        &self,
        store_endpoint: &Url,
        secret_name: &str,
        credential: &dyn TokenCredential,
    ) -> Result<SecretValue, SecretRetrievalError> {
        validate_endpoint(store_endpoint)?;
        validate_name(secret_name)?;

        info!(
            "Retrieving secret '{}' from {}",
            secret_name,
            store_endpoint.host_str().unwrap_or_default()
        );

        let url = Self::secret_url(store_endpoint, secret_name)?;
        let token = credential.get_token(KEY_VAULT_SCOPE).await?;

        let response = self
            .client
            .get(url)
            .bearer_auth(&token.token)
            .send()
            .await
            .map_err(SecretRetrievalError::Request)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::NOT_FOUND => SecretRetrievalError::NotFound(secret_name.to_string()),
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    SecretRetrievalError::Unauthorized {
                        name: secret_name.to_string(),
                        status: status.as_u16(),
                        body,
                    }
                }
                _ => SecretRetrievalError::Status {
                    name: secret_name.to_string(),
                    status: status.as_u16(),
                    body,
                },
            });
        }

        let body = response.text().await.map_err(SecretRetrievalError::Request)?;
        let bundle: SecretBundle =
            serde_json::from_str(&body).map_err(|err| SecretRetrievalError::Parse {
                name: secret_name.to_string(),
                reason: err.to_string(),
            })?;

        let value = bundle
            .value
            .and_then(SecretValue::new)
            .ok_or_else(|| SecretRetrievalError::EmptyValue(secret_name.to_string()))?;

        info!("Secret '{}' retrieved", secret_name);
        Ok(value)
    }
}
