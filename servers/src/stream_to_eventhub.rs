//! # Stream to Event Hub
//!
//! Mimics a continuous data stream: on every cron tick it reads the event hub
//! connection string from a key vault, polls a JSON API once and publishes the
//! snapshot as a single event.
//!
//! ## Startup:
//! 1.  Loads `.env`, then layers defaults, the JSON config file, environment
//!     and CLI flags into validated `RelaySettings`.
//! 2.  Installs console and rolling JSON file logging, then reports how the
//!     config file was handled.
//! 3.  Builds the identity credential chain (client secret, then managed
//!     identity) and the relay components.
//! 4.  Starts the timer trigger and waits for Ctrl-C / SIGTERM through
//!     `tokio-graceful`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_graceful::{Shutdown, ShutdownGuard};
use tracing::{error, info};

use lib_relay::configs::load_config;
use lib_relay::ingestors::EventHubRelay;
use lib_relay::loggers::{LogOptions, setup_logging};
use lib_relay::retrieve::build_http_client;
use lib_relay::scheduler::TimerTrigger;
use lib_relay::secrets::DefaultCredential;

#[tokio::main]
async fn main() -> Result<()> {
    // load .env files before anything else
    dotenvy::dotenv().ok();

    // Logging is not up yet: the config file outcome is reported below, or
    // on stderr if the configuration is unusable.
    let (config, config_notice) = load_config();
    let settings = config
        .validate()
        .inspect_err(|_| {
            if config_notice.is_warning() {
                eprintln!("{}", config_notice);
            }
        })
        .context("invalid configuration")?;

    let log_options = LogOptions {
        log_dir: settings.log_dir.clone(),
        log_level: settings.log_level.clone(),
        file_prefix: env!("CARGO_BIN_NAME").to_string(),
        max_log_files: settings.max_log_files,
    };
    // Flushes the file writer on drop; held until main returns.
    let _log_guard = match setup_logging(&log_options) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            std::process::exit(1);
        }
    };

    config_notice.log();
    info!("Starting with {:?}", settings);

    let identity_client =
        build_http_client(settings.http_timeout).context("failed to build the identity HTTP client")?;
    let credential = DefaultCredential::from_lookup(identity_client, |key| std::env::var(key).ok())
        .context("failed to configure the identity credential")?;
    info!("Identity sources: {:?}", credential.source_names());

    let relay = Arc::new(
        EventHubRelay::from_settings(&settings, Arc::new(credential))
            .context("failed to build the relay")?,
    );

    let trigger = TimerTrigger::start(relay, &settings.schedule, settings.run_on_startup)
        .await
        .context("failed to start the timer trigger")?;

    let shutdown: Shutdown = Shutdown::default();
    shutdown.spawn_task_fn(move |shutdown_guard: ShutdownGuard| async move {
        shutdown_guard.cancelled().await;
        info!("Signal received: stopping the timer trigger");
        if let Err(e) = trigger.shutdown().await {
            error!("Failed to stop the timer trigger cleanly: {}", e);
        }
    });

    match shutdown.shutdown_with_limit(Duration::from_secs(30)).await {
        Ok(elapsed) => {
            info!(
                "shutdown: gracefully {}s after shutdown signal received",
                elapsed.as_secs_f64()
            );
        }
        Err(e) => {
            info!("shutdown: forcefully due to timeout: {}", e);
        }
    }

    info!("Bye!");

    Ok(())
}
