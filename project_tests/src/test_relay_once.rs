//! # Relay Once Live Test
//!
//! Runs exactly one relay cycle with the production wiring and the same
//! configuration sources as `stream_to_eventhub`, then exits. Useful to
//! check vault access, the source API and the event hub key in one go.

use std::sync::Arc;

use lib_relay::configs::load_config;
use lib_relay::ingestors::EventHubRelay;
use lib_relay::loggers::{LogOptions, setup_logging};
use lib_relay::retrieve::build_http_client;
use lib_relay::secrets::DefaultCredential;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let (config, config_notice) = load_config();
    println!("[*] {}", config_notice);
    let settings = config.validate()?;

    let _guard = setup_logging(&LogOptions {
        log_dir: settings.log_dir.clone(),
        log_level: settings.log_level.clone(),
        file_prefix: "test_relay_once".to_string(),
        max_log_files: settings.max_log_files,
    })?;

    let credential = DefaultCredential::from_lookup(
        build_http_client(settings.http_timeout)?,
        |key| std::env::var(key).ok(),
    )?;
    println!("[*] Identity sources: {:?}", credential.source_names());

    let relay = EventHubRelay::from_settings(&settings, Arc::new(credential))?;
    println!("[*] Target: {:?}", relay.target());

    match relay.run_once().await {
        Ok(report) => {
            println!(
                "\n[SUCCESS] One event published to '{}' in {} ms",
                report.eventhub_name,
                report.elapsed.as_millis()
            );
        }
        Err(e) => {
            eprintln!("\n[ERROR] Relay cycle failed at the {} stage:", e.stage());
            eprintln!(">>> {}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}
