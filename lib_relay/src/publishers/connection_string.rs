//! # Connection Strings
//!
//! Parsing and composition of the `key=value;key=value;` authorization
//! strings used by the event hub namespace.
//!
//! The secret stored in the vault is namespace-scoped:
//!
//! ```text
//! Endpoint=sb://<namespace>.servicebus.windows.net/;SharedAccessKeyName=<name>;SharedAccessKey=<key>;
//! ```
//!
//! and [`build_connection_descriptor`] appends `EntityPath=<event hub>` to it.
//! Keys are matched case-insensitively, `=` may appear inside a value, and
//! empty segments are ignored.

use std::fmt;

use thiserror::Error;
use url::Url;

use crate::secrets::SecretValue;

/// Routing attribute appended to the secret.
pub const ENTITY_PATH_KEY: &str = "EntityPath";

const ENDPOINT_KEY: &str = "Endpoint";
const KEY_NAME_KEY: &str = "SharedAccessKeyName";
const KEY_KEY: &str = "SharedAccessKey";
const SIGNATURE_KEY: &str = "SharedAccessSignature";
const EMULATOR_KEY: &str = "UseDevelopmentEmulator";

/// The shape operators are pointed at when a descriptor is rejected.
pub const EXPECTED_SHAPE: &str = "Endpoint=sb://<NAME_SPACE>.servicebus.windows.net/;SharedAccessKeyName=<KEY_NAME>;SharedAccessKey=<KEY_VALUE>;EntityPath=<EVENT_HUB_NAME>";

/// Grammar and content errors. Messages name keys, never values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectionStringError {
    /// Nothing but whitespace and separators.
    #[error("connection string is empty")]
    Empty,

    /// A segment without `=` or with an empty key.
    #[error("connection string segment {index} is not a key=value pair")]
    MalformedSegment {
        /// Zero-based position among the non-empty segments.
        index: usize,
    },

    /// The same key appears twice.
    #[error("connection string contains '{0}' more than once")]
    DuplicateKey(String),

    /// The secret already routes to an entity.
    #[error("secret already contains an EntityPath; store the namespace-level connection string instead")]
    EntityPathPresent,

    /// The routing name is blank or would break the grammar.
    #[error("invalid routing name '{0}': must be non-empty and contain no ';' or '='")]
    InvalidRoutingName(String),

    /// No `Endpoint` key.
    #[error("connection string has no Endpoint")]
    MissingEndpoint,

    /// `Endpoint` is not an `sb://` URL with a host.
    #[error("invalid Endpoint '{endpoint}': {reason}")]
    InvalidEndpoint {
        /// The offending endpoint.
        endpoint: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Neither a key pair nor a shared access signature is present.
    #[error("connection string needs SharedAccessKeyName and SharedAccessKey, or SharedAccessSignature")]
    MissingCredentials,

    /// `EntityPath` disagrees with the event hub the client was asked for.
    #[error("EntityPath '{entity_path}' does not match event hub '{eventhub_name}'")]
    EntityPathMismatch {
        /// Value found in the string.
        entity_path: String,
        /// Event hub requested by the caller.
        eventhub_name: String,
    },
}

/// How the producer proves its right to send.
#[derive(Clone, PartialEq, Eq)]
pub enum SasCredential {
    /// A policy key; tokens are signed locally.
    Key {
        /// Policy name (`SharedAccessKeyName`).
        name: String,
        /// Policy key (`SharedAccessKey`).
        key: String,
    },
    /// A pre-issued `SharedAccessSignature ...` token used as-is.
    Signature(String),
}

impl fmt::Debug for SasCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SasCredential::Key { name, .. } => f
                .debug_struct("Key")
                .field("name", name)
                .field("key", &"*****")
                .finish(),
            SasCredential::Signature(_) => f.write_str("Signature(*****)"),
        }
    }
}

/// A validated connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionProperties {
    /// `sb://<namespace>/` as written in the string.
    pub endpoint: Url,
    /// Host (and port, if any) of the namespace.
    pub fully_qualified_namespace: String,
    /// Signing material.
    pub credential: SasCredential,
    /// Target event hub, if the string names one.
    pub entity_path: Option<String>,
    /// Talk plain `http` to a local emulator.
    pub use_development_emulator: bool,
}

impl ConnectionProperties {
    /// Parses and validates a connection string.
    pub fn parse(connection_string: &str) -> Result<Self, ConnectionStringError> {
        let pairs = parse_pairs(connection_string)?;

        let raw_endpoint = lookup(&pairs, ENDPOINT_KEY).ok_or(ConnectionStringError::MissingEndpoint)?;
        let endpoint = parse_endpoint(raw_endpoint)?;
        let fully_qualified_namespace = match endpoint.port() {
            Some(port) => format!("{}:{}", endpoint.host_str().unwrap_or_default(), port),
            None => endpoint.host_str().unwrap_or_default().to_string(),
        };

        let credential = match (
            lookup(&pairs, KEY_NAME_KEY),
            lookup(&pairs, KEY_KEY),
            lookup(&pairs, SIGNATURE_KEY),
        ) {
            (_, _, Some(signature)) if !signature.is_empty() => {
                SasCredential::Signature(signature.to_string())
            }
            (Some(name), Some(key), _) if !name.is_empty() && !key.is_empty() => SasCredential::Key {
                name: name.to_string(),
                key: key.to_string(),
            },
            _ => return Err(ConnectionStringError::MissingCredentials),
        };

        let entity_path = lookup(&pairs, ENTITY_PATH_KEY)
            .filter(|path| !path.is_empty())
            .map(str::to_string);

        let use_development_emulator = lookup(&pairs, EMULATOR_KEY)
            .map(|flag| flag.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(Self {
            endpoint,
            fully_qualified_namespace,
            credential,
            entity_path,
            use_development_emulator,
        })
    }

    /// Resolves the event hub to publish to: `EntityPath` if present, which
    /// must then agree with `eventhub_name`.
    pub fn resolve_eventhub<'a>(&'a self, eventhub_name: &'a str) -> Result<&'a str, ConnectionStringError> {
        match self.entity_path.as_deref() {
            Some(path) if !eventhub_name.is_empty() && path != eventhub_name => {
                Err(ConnectionStringError::EntityPathMismatch {
                    entity_path: path.to_string(),
                    eventhub_name: eventhub_name.to_string(),
                })
            }
            Some(path) => Ok(path),
            None if eventhub_name.is_empty() => {
                Err(ConnectionStringError::InvalidRoutingName(String::new()))
            }
            None => Ok(eventhub_name),
        }
    }

    /// A normalized connection string for `eventhub_name`, rebuilt from the
    /// parsed parts. Clients that take a connection string are handed this.
    pub fn to_connection_descriptor(&self, eventhub_name: &str) -> ConnectionDescriptor {
        let mut out = format!("{}=sb://{}/;", ENDPOINT_KEY, self.fully_qualified_namespace);
        match &self.credential {
            SasCredential::Key { name, key } => {
                out.push_str(&format!("{}={};{}={};", KEY_NAME_KEY, name, KEY_KEY, key));
            }
            SasCredential::Signature(signature) => {
                out.push_str(&format!("{}={};", SIGNATURE_KEY, signature));
            }
        }
        if self.use_development_emulator {
            out.push_str(&format!("{}=true;", EMULATOR_KEY));
        }
        out.push_str(&format!("{}={}", ENTITY_PATH_KEY, eventhub_name));
        ConnectionDescriptor(out)
    }
}

/// The secret with `EntityPath=<routing name>` appended. Carries key
/// material, so it is redacted when formatted.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor(String);

impl ConnectionDescriptor {
    /// The full string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConnectionDescriptor(*****)")
    }
}

/// Appends `EntityPath=<routing_name>` to the resolved secret.
///
/// Fails if the secret already carries an `EntityPath`, is not valid
/// `key=value;` text, or if `routing_name` is blank. A `;` separator is
/// inserted when the secret does not end with one.
pub fn build_connection_descriptor(
    secret: &SecretValue,
    routing_name: &str,
) -> Result<ConnectionDescriptor, ConnectionStringError> {
    if routing_name.trim().is_empty() || routing_name.contains([';', '=']) {
        return Err(ConnectionStringError::InvalidRoutingName(routing_name.to_string()));
    }

    let base = secret.expose().trim_end();
    let pairs = parse_pairs(base)?;
    if lookup(&pairs, ENTITY_PATH_KEY).is_some() {
        return Err(ConnectionStringError::EntityPathPresent);
    }

    let separator = if base.ends_with(';') { "" } else { ";" };
    Ok(ConnectionDescriptor(format!(
        "{}{}{}={}",
        base, separator, ENTITY_PATH_KEY, routing_name
    )))
}

fn parse_pairs(raw: &str) -> Result<Vec<(&str, &str)>, ConnectionStringError> {
    let mut pairs: Vec<(&str, &str)> = Vec::new();

    for (index, segment) in raw
        .split(';')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .enumerate()
    {
        let (key, value) = segment
            .split_once('=')
            .ok_or(ConnectionStringError::MalformedSegment { index })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(ConnectionStringError::MalformedSegment { index });
        }
        if lookup(&pairs, key).is_some() {
            return Err(ConnectionStringError::DuplicateKey(key.to_string()));
        }
        pairs.push((key, value.trim()));
    }

    if pairs.is_empty() {
        return Err(ConnectionStringError::Empty);
    }
    Ok(pairs)
}

fn lookup<'a>(pairs: &[(&str, &'a str)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| *v)
}

fn parse_endpoint(raw: &str) -> Result<Url, ConnectionStringError> {
    let invalid = |reason: &str| ConnectionStringError::InvalidEndpoint {
        endpoint: raw.to_string(),
        reason: reason.to_string(),
    };

    let url = Url::parse(raw).map_err(|err| invalid(&err.to_string()))?;
    if url.scheme() != "sb" {
        return Err(invalid("scheme must be sb://"));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing namespace host"));
    }
    Ok(url)
}
