use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use url::{Url, form_urlencoded};

use crate::utils::redact_url;

/// Placeholder in `ApiUrl` replaced by the (URL-encoded) `ApiKey`.
pub const API_KEY_PLACEHOLDER: &str = "{api_key}";

/// Config file read when `--config-path` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "stream_to_eventhub.conf";

/// Every tick at second zero, i.e. once a minute.
pub const DEFAULT_SCHEDULE: &str = "0 * * * * *";

/// How events reach the event hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PublishTransport {
    /// AMQP tunnelled over a WebSocket on port 443.
    #[default]
    AmqpWebsockets,
    /// The namespace REST send endpoint, also on port 443. Required for the
    /// local development emulator.
    Https,
}

impl fmt::Display for PublishTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PublishTransport::AmqpWebsockets => "amqp-websockets",
            PublishTransport::Https => "https",
        })
    }
}

/// Raw configuration. Every field is optional so layers can be merged;
/// [`RelayConfig::validate`] turns the merged result into [`RelaySettings`].
#[derive(Parser, Deserialize, Serialize, Clone, Default, PartialEq, Eq)]
#[clap(about = "Scheduled relay from a JSON API to an event hub", version)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    /// Key vault name; the vault URL is https://<name>.vault.azure.net.
    #[clap(long, env = "VaultName")]
    pub vault_name: Option<String>,

    /// Full key vault URL, overriding --vault-name (emulators).
    #[clap(long, env = "VaultUrl")]
    pub vault_url: Option<String>,

    /// Name of the secret holding the event hub connection string.
    #[clap(long, env = "SecretName")]
    pub secret_name: Option<String>,

    /// Event hub that receives the data.
    #[clap(long, env = "EventHubName")]
    pub eventhub_name: Option<String>,

    /// Key substituted for {api_key} in the API URL.
    #[clap(long, env = "ApiKey")]
    pub api_key: Option<String>,

    /// Source API URL; may contain an {api_key} placeholder.
    #[clap(long, env = "ApiUrl")]
    pub api_url: Option<String>,

    /// Six-field cron expression (sec min hour day month weekday), UTC.
    #[clap(long, env = "RELAY_SCHEDULE")]
    pub schedule: Option<String>,

    /// Run one cycle immediately at startup.
    #[clap(long, env = "RELAY_RUN_ON_STARTUP")]
    pub run_on_startup: Option<bool>,

    /// Timeout in seconds for every outbound request.
    #[clap(long, env = "RELAY_HTTP_TIMEOUT_SECS")]
    pub http_timeout_secs: Option<u64>,

    /// Event hub transport.
    #[clap(long, env = "RELAY_TRANSPORT", value_enum)]
    pub transport: Option<PublishTransport>,

    /// Path to the JSON configuration file.
    #[clap(long, env = "RELAY_CONFIG_PATH")]
    pub config_path: Option<PathBuf>,

    /// Directory for log files.
    #[clap(long, env = "LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Logging level used when RUST_LOG is unset (trace, debug, info, warn, error).
    #[clap(long, env = "RELAY_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Rotated log files to keep.
    #[clap(long, env = "RELAY_MAX_LOG_FILES")]
    pub max_log_files: Option<usize>,
}

impl fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConfig")
            .field("vault_name", &self.vault_name)
            .field("vault_url", &self.vault_url)
            .field("secret_name", &self.secret_name)
            .field("eventhub_name", &self.eventhub_name)
            .field("api_key", &self.api_key.as_ref().map(|_| "*****"))
            .field("api_url", &self.api_url.as_deref().map(redact_url))
            .field("schedule", &self.schedule)
            .field("run_on_startup", &self.run_on_startup)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("transport", &self.transport)
            .field("config_path", &self.config_path)
            .field("log_dir", &self.log_dir)
            .field("log_level", &self.log_level)
            .field("max_log_files", &self.max_log_files)
            .finish()
    }
}

/// Missing or unusable configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A required value has no source.
    #[error("missing required setting '{0}'")]
    Missing(&'static str),

    /// A value is present but unusable.
    #[error("invalid setting '{field}': {reason}")]
    Invalid {
        /// Environment name of the setting.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

impl RelayConfig {
    /// Built-in defaults, the lowest layer.
    pub fn defaults() -> Self {
        RelayConfig {
            schedule: Some(DEFAULT_SCHEDULE.to_string()),
            run_on_startup: Some(true),
            http_timeout_secs: Some(30),
            transport: Some(PublishTransport::default()),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            max_log_files: Some(7),
            ..Default::default()
        }
    }

    // 'other' overrides 'self' for Some values
    fn merge(self, other: RelayConfig) -> RelayConfig {
        RelayConfig {
            vault_name: other.vault_name.or(self.vault_name),
            vault_url: other.vault_url.or(self.vault_url),
            secret_name: other.secret_name.or(self.secret_name),
            eventhub_name: other.eventhub_name.or(self.eventhub_name),
            api_key: other.api_key.or(self.api_key),
            api_url: other.api_url.or(self.api_url),
            schedule: other.schedule.or(self.schedule),
            run_on_startup: other.run_on_startup.or(self.run_on_startup),
            http_timeout_secs: other.http_timeout_secs.or(self.http_timeout_secs),
            transport: other.transport.or(self.transport),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            max_log_files: other.max_log_files.or(self.max_log_files),
        }
    }

    /// Checks the merged configuration and builds the immutable settings.
    pub fn validate(&self) -> Result<RelaySettings, ConfigError> {
        let vault_url = match (non_blank(&self.vault_url), non_blank(&self.vault_name)) {
            (Some(url), _) => parse_vault_url(url)?,
            (None, Some(name)) => vault_url_from_name(name)?,
            (None, None) => return Err(ConfigError::Missing("VaultName")),
        };

        let secret_name = non_blank(&self.secret_name)
            .ok_or(ConfigError::Missing("SecretName"))?
            .to_string();
        let eventhub_name = non_blank(&self.eventhub_name)
            .ok_or(ConfigError::Missing("EventHubName"))?
            .to_string();
        if eventhub_name.contains([';', '=']) {
            return Err(ConfigError::Invalid {
                field: "EventHubName",
                reason: "must not contain ';' or '='".to_string(),
            });
        }

        let api_url = build_api_url(
            non_blank(&self.api_url).ok_or(ConfigError::Missing("ApiUrl"))?,
            non_blank(&self.api_key),
        )?;

        let schedule = non_blank(&self.schedule).unwrap_or(DEFAULT_SCHEDULE).to_string();
        let fields = schedule.split_whitespace().count();
        if !(6..=7).contains(&fields) {
            return Err(ConfigError::Invalid {
                field: "RELAY_SCHEDULE",
                reason: format!("expected 6 or 7 cron fields, found {}", fields),
            });
        }

        let http_timeout_secs = self.http_timeout_secs.unwrap_or(30);
        if http_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "RELAY_HTTP_TIMEOUT_SECS",
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(RelaySettings {
            vault_url,
            secret_name,
            eventhub_name,
            api_url,
            schedule,
            run_on_startup: self.run_on_startup.unwrap_or(true),
            http_timeout: Duration::from_secs(http_timeout_secs),
            transport: self.transport.unwrap_or_default(),
            log_dir: self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: non_blank(&self.log_level).unwrap_or("info").to_string(),
            max_log_files: self.max_log_files.unwrap_or(7),
        })
    }
}

/// Validated, immutable settings handed to the relay at startup.
#[derive(Clone, PartialEq, Eq)]
pub struct RelaySettings {
    /// Key vault endpoint.
    pub vault_url: Url,
    /// Secret holding the namespace connection string.
    pub secret_name: String,
    /// Destination event hub (routing name).
    pub eventhub_name: String,
    /// Source API URL, key already embedded.
    pub api_url: Url,
    /// Cron expression, UTC.
    pub schedule: String,
    /// Fire once at startup as well.
    pub run_on_startup: bool,
    /// Per-request timeout.
    pub http_timeout: Duration,
    /// Event hub transport.
    pub transport: PublishTransport,
    /// Log directory.
    pub log_dir: PathBuf,
    /// Fallback level when `RUST_LOG` is unset.
    pub log_level: String,
    /// Rotated log files kept.
    pub max_log_files: usize,
}

impl fmt::Debug for RelaySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelaySettings")
            .field("vault_url", &self.vault_url.as_str())
            .field("secret_name", &self.secret_name)
            .field("eventhub_name", &self.eventhub_name)
            .field("api_url", &redact_url(self.api_url.as_str()))
            .field("schedule", &self.schedule)
            .field("run_on_startup", &self.run_on_startup)
            .field("http_timeout", &self.http_timeout)
            .field("transport", &self.transport)
            .field("log_dir", &self.log_dir)
            .field("log_level", &self.log_level)
            .field("max_log_files", &self.max_log_files)
            .finish()
    }
}

/// What happened to the config file. Loading runs before the subscriber is
/// installed, so the caller reports this with [`ConfigNotice::log`] once
/// logging is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigNotice {
    /// The file was read and merged.
    Loaded(PathBuf),
    /// No file at the path.
    NotFound(PathBuf),
    /// The file exists but could not be read.
    Unreadable {
        /// File path.
        path: PathBuf,
        /// I/O error.
        reason: String,
    },
    /// The file is not a valid JSON configuration.
    Unparseable {
        /// File path.
        path: PathBuf,
        /// Parser message.
        reason: String,
    },
}

impl ConfigNotice {
    /// True when the file was present but ignored.
    pub fn is_warning(&self) -> bool {
        matches!(self, ConfigNotice::Unreadable { .. } | ConfigNotice::Unparseable { .. })
    }

    /// Emits the notice through `tracing`.
    pub fn log(&self) {
        if self.is_warning() {
            warn!("{}", self);
        } else {
            info!("{}", self);
        }
    }
}

impl fmt::Display for ConfigNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigNotice::Loaded(path) => write!(f, "Loaded config file {}", path.display()),
            ConfigNotice::NotFound(path) => write!(
                f,
                "Config file not found at {}. Using defaults and environment/CLI variables.",
                path.display()
            ),
            ConfigNotice::Unreadable { path, reason } => write!(
                f,
                "Failed to read config file {}: {}. Falling back to other sources.",
                path.display(),
                reason
            ),
            ConfigNotice::Unparseable { path, reason } => write!(
                f,
                "Failed to parse config file {}: {}. Falling back to other sources.",
                path.display(),
                reason
            ),
        }
    }
}

/// Parses CLI flags and environment, then layers them over the config file
/// and the defaults. Exits with usage on bad flags, like any clap binary.
pub fn load_config() -> (RelayConfig, ConfigNotice) {
    resolve_config(RelayConfig::parse())
}

/// Layers `cli` (flags plus environment) over the config file it points
/// at, which in turn overrides [`RelayConfig::defaults`].
pub fn resolve_config(cli: RelayConfig) -> (RelayConfig, ConfigNotice) {
    let path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = RelayConfig::defaults();

    let notice = if path.exists() {
        match fs::read_to_string(&path) {
            Ok(config_str) => match serde_json::from_str::<RelayConfig>(&config_str) {
                Ok(file_config) => {
                    current_config = current_config.merge(file_config);
                    ConfigNotice::Loaded(path)
                }
                Err(err) => ConfigNotice::Unparseable {
                    path,
                    reason: err.to_string(),
                },
            },
            Err(err) => ConfigNotice::Unreadable {
                path,
                reason: err.to_string(),
            },
        }
    } else {
        ConfigNotice::NotFound(path)
    };

    (current_config.merge(cli), notice)
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn vault_url_from_name(name: &str) -> Result<Url, ConfigError> {
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(ConfigError::Invalid {
            field: "VaultName",
            reason: "must contain only letters, digits and '-'".to_string(),
        });
    }
    Url::parse(&format!("https://{}.vault.azure.net", name)).map_err(|err| ConfigError::Invalid {
        field: "VaultName",
        reason: err.to_string(),
    })
}

fn parse_vault_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|err| ConfigError::Invalid {
        field: "VaultUrl",
        reason: err.to_string(),
    })?;
    if !matches!(url.scheme(), "https" | "http") {
        return Err(ConfigError::Invalid {
            field: "VaultUrl",
            reason: "scheme must be https".to_string(),
        });
    }
    Ok(url)
}

fn build_api_url(template: &str, api_key: Option<&str>) -> Result<Url, ConfigError> {
    let raw = if template.contains(API_KEY_PLACEHOLDER) {
        let key = api_key.ok_or(ConfigError::Missing("ApiKey"))?;
        let encoded: String = form_urlencoded::byte_serialize(key.as_bytes()).collect();
        template.replace(API_KEY_PLACEHOLDER, &encoded)
    } else {
        template.to_string()
    };

    let url = Url::parse(&raw).map_err(|err| ConfigError::Invalid {
        field: "ApiUrl",
        reason: err.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::Invalid {
            field: "ApiUrl",
            reason: "scheme must be http or https".to_string(),
        });
    }
    Ok(url)
}
