use std::fs;
use std::path::PathBuf;

use thiserror::Error;
use tracing::info;
use tracing_appender::non_blocking;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, prelude::*};

/// Where and how much to log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    /// Directory for the rotated files; created if missing.
    pub log_dir: PathBuf,
    /// Filter used when `RUST_LOG` is unset, e.g. `info` or `lib_relay=debug`.
    pub log_level: String,
    /// File name prefix, usually the binary name.
    pub file_prefix: String,
    /// Rotated files to keep; older ones are deleted on rotation.
    pub max_log_files: usize,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            log_level: "info".to_string(),
            file_prefix: "stream_to_eventhub".to_string(),
            max_log_files: 7,
        }
    }
}

/// Subscriber setup failures.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// The log directory could not be created.
    #[error("failed to create log directory {path}: {source}")]
    CreateDir {
        /// Directory path.
        path: PathBuf,
        /// I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The rolling appender could not open its file.
    #[error("failed to initialise the log file appender: {0}")]
    Appender(#[from] InitError),

    /// `RUST_LOG`, or the fallback level when it is unset, is not a valid filter.
    #[error("invalid log filter '{filter}': {reason}")]
    Filter {
        /// The rejected filter.
        filter: String,
        /// Parser message.
        reason: String,
    },

    /// A global subscriber was already installed.
    #[error("a global tracing subscriber is already set: {0}")]
    AlreadyInitialized(String),
}

/// Daily appender writing `<prefix>.<date>.log` into `options.log_dir`.
pub fn build_file_appender(options: &LogOptions) -> Result<RollingFileAppender, LoggingError> {
    fs::create_dir_all(&options.log_dir).map_err(|source| LoggingError::CreateDir {
        path: options.log_dir.clone(),
        source,
    })?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(options.file_prefix.as_str())
        .filename_suffix("log")
        .max_log_files(options.max_log_files.max(1))
        .build(&options.log_dir)?;
    Ok(appender)
}

/// `rust_log` when set, otherwise `fallback`. A `RUST_LOG` that does not
/// parse is an error rather than a silent fallback, since no subscriber is
/// installed yet to report it.
pub fn build_env_filter(rust_log: Option<&str>, fallback: &str) -> Result<EnvFilter, LoggingError> {
    let directives = rust_log
        .map(str::trim)
        .filter(|directives| !directives.is_empty())
        .unwrap_or(fallback);

    EnvFilter::try_new(directives).map_err(|err| LoggingError::Filter {
        filter: directives.to_string(),
        reason: err.to_string(),
    })
}

/// Installs the global subscriber: env filter, console layer with targets
/// and ANSI colours, JSON file layer.
///
/// The returned guard flushes the file writer when dropped; keep it alive
/// for the lifetime of the process.
pub fn setup_logging(options: &LogOptions) -> Result<WorkerGuard, LoggingError> {
    let file_appender = build_file_appender(options)?;
    let (non_blocking_appender, guard) = non_blocking(file_appender);

    let console_layer = fmt::layer().with_target(true).with_ansi(true);

    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking_appender)
        .json();

    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let env_filter = build_env_filter(rust_log.as_deref(), &options.log_level)?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|err| LoggingError::AlreadyInitialized(err.to_string()))?;

    info!(
        "Logging initialized with level: {} (files in {})",
        rust_log.as_deref().unwrap_or(&options.log_level),
        options.log_dir.display()
    );
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_filter_prefers_rust_log() {
        let filter = build_env_filter(Some("lib_relay=debug"), "warn").unwrap();
        assert_eq!(filter.to_string(), "lib_relay=debug");

        let filter = build_env_filter(None, "warn").unwrap();
        assert_eq!(filter.to_string(), "warn");
    }

    #[test]
    fn test_env_filter_reports_invalid_rust_log() {
        let err = build_env_filter(Some("lib_relay=loud"), "info").unwrap_err();
        match err {
            LoggingError::Filter { filter, .. } => assert_eq!(filter, "lib_relay=loud"),
            other => panic!("unexpected error: {other}"),
        }

        let filter = build_env_filter(Some("  "), "warn").unwrap();
        assert_eq!(filter.to_string(), "warn");
    }

    #[test]
    fn test_env_filter_rejects_bad_fallback() {
        let err = build_env_filter(None, "lib_relay=loud").unwrap_err();
        assert!(matches!(err, LoggingError::Filter { .. }));
    }

    #[test]
    fn test_file_appender_creates_dir_and_writes_json() {
        let tmp = tempfile::tempdir().unwrap();
        let options = LogOptions {
            log_dir: tmp.path().join("nested").join("logs"),
            file_prefix: "relay_test".to_string(),
            ..LogOptions::default()
        };

        let appender = build_file_appender(&options).unwrap();
        assert!(options.log_dir.is_dir());

        let (writer, guard) = non_blocking(appender);
        let subscriber = tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(writer).json());
        tracing::subscriber::with_default(subscriber, || {
            info!(stage = "fetch", "cycle finished");
        });
        drop(guard);

        let files: Vec<_> = fs::read_dir(&options.log_dir)
            .unwrap()
            .filter_map(Result::ok)
            .collect();
        assert_eq!(files.len(), 1);
        let name = files[0].file_name().to_string_lossy().to_string();
        assert!(name.starts_with("relay_test.") && name.ends_with(".log"), "{}", name);

        let contents = fs::read_to_string(files[0].path()).unwrap();
        let line: serde_json::Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(line["fields"]["message"], "cycle finished");
        assert_eq!(line["fields"]["stage"], "fetch");
        assert_eq!(line["level"], "INFO");
    }
}
