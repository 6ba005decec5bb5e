//! # Identity Credentials
//!
//! Bearer-token sources used to authenticate against the secret store.
//!
//! Every credential is an explicit value built by the caller and handed to the
//! resolver. Tokens are requested lazily on the first `get_token` call of an
//! invocation and are not cached here.
//!
//! ## Sources:
//! - [`ClientSecretCredential`]: OAuth2 client-credentials flow with a service principal.
//! - [`ManagedIdentityCredential`]: the hosting platform's identity endpoint
//!   (App Service / Functions) or the instance metadata service.
//! - [`StaticTokenCredential`]: a pre-issued token, for emulators and tests.
//! - [`DefaultCredential`]: an ordered chain of the above; first success wins.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// OAuth2 scope of the key vault data plane.
pub const KEY_VAULT_SCOPE: &str = "https://vault.azure.net/.default";

const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";
const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";
const APP_SERVICE_API_VERSION: &str = "2019-08-01";
const IMDS_TIMEOUT: Duration = Duration::from_secs(3);

/// A bearer token and, when the issuer reported it, its expiry in Unix seconds.
#[derive(Clone)]
pub struct AccessToken {
    /// The raw bearer token.
    pub token: String,
    /// Expiry as Unix seconds.
    pub expires_on: Option<i64>,
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"*****")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

/// Errors raised while obtaining a token.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// Required settings for this source are missing.
    #[error("credential configuration is incomplete: {0}")]
    Configuration(String),

    /// The token endpoint answered with a non-success status.
    #[error("token endpoint rejected the request: {status} {body}")]
    Unauthorized {
        /// HTTP status returned by the token endpoint.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },

    /// The token endpoint could not be reached.
    #[error("failed to request token: {0}")]
    Request(String),

    /// The token endpoint answered with an unexpected body.
    #[error("failed to parse token response: {0}")]
    Parse(String),

    /// Every source of a chained credential failed.
    #[error("no credential source succeeded: {}", .0.join("; "))]
    Exhausted(Vec<String>),
}

/// A source of bearer tokens for a given OAuth2 scope.
#[async_trait]
pub trait TokenCredential: Send + Sync {
    /// Requests a token for `scope`.
    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError>;

    /// Short name used in diagnostics.
    fn name(&self) -> &'static str;
}

/// Service principal authentication through the OAuth2 client-credentials flow.
pub struct ClientSecretCredential {
    client: Client,
    authority_host: String,
    tenant_id: String,
    client_id: String,
    client_secret: String,
}

impl ClientSecretCredential {
    /// Creates a credential against the public cloud authority.
    pub fn new(
        client: Client,
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            client,
            authority_host: DEFAULT_AUTHORITY_HOST.to_string(),
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    /// Overrides the authority host (sovereign clouds, tests).
    pub fn with_authority_host(mut self, authority_host: impl Into<String>) -> Self {
        self.authority_host = authority_host.into().trim_end_matches('/').to_string();
        self
    }

    /// Builds the credential from `AZURE_TENANT_ID`, `AZURE_CLIENT_ID`,
    /// `AZURE_CLIENT_SECRET` and the optional `AZURE_AUTHORITY_HOST`, read
    /// through `lookup`.
    pub fn from_lookup<F>(client: Client, lookup: F) -> Result<Self, CredentialError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .ok_or_else(|| CredentialError::Configuration(format!("missing {key}")))
        };

        let mut credential = Self::new(
            client,
            get("AZURE_TENANT_ID")?,
            get("AZURE_CLIENT_ID")?,
            get("AZURE_CLIENT_SECRET")?,
        );
        if let Ok(host) = get("AZURE_AUTHORITY_HOST") {
            credential = credential.with_authority_host(host);
        }
        Ok(credential)
    }

    fn token_endpoint(&self) -> String {
        format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority_host, self.tenant_id
        )
    }
}

#[derive(Deserialize)]
struct ClientCredentialsResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[async_trait]
impl TokenCredential for ClientSecretCredential {
    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError> {
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", scope),
            ("grant_type", "client_credentials"),
        ];

        let response = self
            .client
            .post(self.token_endpoint())
            .form(&params)
            .send()
            .await
            .map_err(|err| CredentialError::Request(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(CredentialError::Unauthorized { status, body });
        }

        let payload: ClientCredentialsResponse = response
            .json()
            .await
            .map_err(|err| CredentialError::Parse(err.to_string()))?;

        Ok(AccessToken {
            token: payload.access_token,
            expires_on: payload
                .expires_in
                .map(|secs| Utc::now().timestamp() + secs),
        })
    }

    fn name(&self) -> &'static str {
        "client_secret"
    }
}

/// Where a managed identity token is requested from.
#[derive(Debug, Clone)]
pub enum ManagedIdentitySource {
    /// App Service / Functions identity endpoint guarded by a per-process header.
    AppService {
        /// Value of `IDENTITY_ENDPOINT`.
        endpoint: Url,
        /// Value of `IDENTITY_HEADER`.
        header: String,
    },
    /// Instance metadata service on the link-local address.
    Imds {
        /// The metadata token endpoint.
        endpoint: Url,
    },
}

/// Token source backed by the platform-assigned (or user-assigned) identity.
pub struct ManagedIdentityCredential {
    client: Client,
    source: ManagedIdentitySource,
    client_id: Option<String>,
}

impl ManagedIdentityCredential {
    /// Creates a credential for an explicit source.
    pub fn new(client: Client, source: ManagedIdentitySource, client_id: Option<String>) -> Self {
        Self {
            client,
            source,
            client_id,
        }
    }

    /// Picks the App Service endpoint when `IDENTITY_ENDPOINT` and
    /// `IDENTITY_HEADER` are present, otherwise the metadata service.
    /// `AZURE_CLIENT_ID` selects a user-assigned identity.
    pub fn from_lookup<F>(client: Client, lookup: F) -> Result<Self, CredentialError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let endpoint = lookup("IDENTITY_ENDPOINT").filter(|v| !v.trim().is_empty());
        let header = lookup("IDENTITY_HEADER").filter(|v| !v.trim().is_empty());

        let source = match (endpoint, header) {
            (Some(endpoint), Some(header)) => ManagedIdentitySource::AppService {
                endpoint: Url::parse(endpoint.trim()).map_err(|err| {
                    CredentialError::Configuration(format!("invalid IDENTITY_ENDPOINT: {err}"))
                })?,
                header,
            },
            _ => ManagedIdentitySource::Imds {
                endpoint: Url::parse(IMDS_ENDPOINT)
                    .map_err(|err| CredentialError::Configuration(err.to_string()))?,
            },
        };

        let client_id = lookup("AZURE_CLIENT_ID").filter(|v| !v.trim().is_empty());
        Ok(Self::new(client, source, client_id))
    }

    fn request(&self, resource: &str) -> reqwest::RequestBuilder {
        match &self.source {
            ManagedIdentitySource::AppService { endpoint, header } => {
                let mut url = endpoint.clone();
                url.query_pairs_mut()
                    .append_pair("resource", resource)
                    .append_pair("api-version", APP_SERVICE_API_VERSION);
                if let Some(id) = &self.client_id {
                    url.query_pairs_mut().append_pair("client_id", id);
                }
                self.client.get(url).header("X-IDENTITY-HEADER", header)
            }
            ManagedIdentitySource::Imds { endpoint } => {
                let mut url = endpoint.clone();
                url.query_pairs_mut()
                    .append_pair("api-version", IMDS_API_VERSION)
                    .append_pair("resource", resource);
                if let Some(id) = &self.client_id {
                    url.query_pairs_mut().append_pair("client_id", id);
                }
                // IMDS only answers plain HTTP on the link-local address.
                self.client
                    .get(url)
                    .header("Metadata", "true")
                    .timeout(IMDS_TIMEOUT)
            }
        }
    }
}

#[derive(Deserialize)]
struct ManagedIdentityResponse {
    access_token: String,
    #[serde(default)]
    expires_on: Option<Value>,
}

/// `expires_on` arrives as a number or a numeric string depending on the endpoint.
fn parse_expires_on(value: Option<Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Turns an OAuth2 v2 scope into the v1 resource the identity endpoints expect.
fn scope_to_resource(scope: &str) -> &str {
    scope.strip_suffix("/.default").unwrap_or(scope)
}

#[async_trait]
impl TokenCredential for ManagedIdentityCredential {
    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError> {
        let response = self
            .request(scope_to_resource(scope))
            .send()
            .await
            .map_err(|err| CredentialError::Request(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(CredentialError::Unauthorized { status, body });
        }

        let payload: ManagedIdentityResponse = response
            .json()
            .await
            .map_err(|err| CredentialError::Parse(err.to_string()))?;

        Ok(AccessToken {
            token: payload.access_token,
            expires_on: parse_expires_on(payload.expires_on),
        })
    }

    fn name(&self) -> &'static str {
        "managed_identity"
    }
}

/// A pre-issued bearer token.
pub struct StaticTokenCredential {
    token: String,
}

impl StaticTokenCredential {
    /// Wraps `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenCredential for StaticTokenCredential {
    async fn get_token(&self, _scope: &str) -> Result<AccessToken, CredentialError> {
        Ok(AccessToken {
            token: self.token.clone(),
            expires_on: None,
        })
    }

    fn name(&self) -> &'static str {
        "static_token"
    }
}

/// Tries each source in order and returns the first token obtained.
pub struct DefaultCredential {
    sources: Vec<Box<dyn TokenCredential>>,
}

impl DefaultCredential {
    /// Chains explicit sources.
    pub fn new(sources: Vec<Box<dyn TokenCredential>>) -> Self {
        Self { sources }
    }

    /// The standard chain: a client secret credential when its variables are
    /// all present, then the managed identity.
    pub fn from_lookup<F>(client: Client, lookup: F) -> Result<Self, CredentialError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut sources: Vec<Box<dyn TokenCredential>> = Vec::new();

        match ClientSecretCredential::from_lookup(client.clone(), &lookup) {
            Ok(credential) => sources.push(Box::new(credential)),
            Err(err) => debug!("Client secret credential not configured: {}", err),
        }
        sources.push(Box::new(ManagedIdentityCredential::from_lookup(
            client, &lookup,
        )?));

        Ok(Self::new(sources))
    }

    /// Names of the chained sources, in order.
    pub fn source_names(&self) -> Vec<&'static str> {
        self.sources.iter().map(|s| s.name()).collect()
    }
}

#[async_trait]
impl TokenCredential for DefaultCredential {
    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError> {
        let mut failures = Vec::with_capacity(self.sources.len());

        for source in &self.sources {
            match source.get_token(scope).await {
                Ok(token) => {
                    debug!("Token acquired through {}", source.name());
                    return Ok(token);
                }
                Err(err) => {
                    debug!("Credential source {} failed: {}", source.name(), err);
                    failures.push(format!("{}: {}", source.name(), err));
                }
            }
        }

        Err(CredentialError::Exhausted(failures))
    }

    fn name(&self) -> &'static str {
        "default"
    }
}
