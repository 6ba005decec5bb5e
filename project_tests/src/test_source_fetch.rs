//! # Source Fetch Live Test
//!
//! Polls a JSON API once through lib_relay and prints the decoded payload
//! together with the exact message body the relay would publish.

use std::time::Duration;

use clap::Parser;
use lib_relay::publishers::encode_payload;
use lib_relay::retrieve::{HttpSourceFetcher, SourceFetcher, build_http_client};
use lib_relay::utils::redact_url;
use url::Url;

#[derive(Parser, Debug)]
#[clap(about = "Fetch one snapshot from a JSON API", version)]
struct Args {
    /// URL to poll (embed the API key if the API needs one).
    #[clap(long, env = "ApiUrl")]
    api_url: String,

    /// Request timeout in seconds.
    #[clap(long, default_value_t = 30)]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let url = Url::parse(&args.api_url)?;

    // // Statement: Same client and fetcher the relay uses on every tick
    let fetcher = HttpSourceFetcher::new(build_http_client(Duration::from_secs(args.timeout_secs))?);

    println!("[*] Requesting {}", redact_url(url.as_str()));

    match fetcher.fetch(&url).await {
        Ok(data) => {
            println!("\n[SUCCESS] Data received:");
            println!("-----------------------------------------------");
            println!("{}", serde_json::to_string_pretty(&data)?);
            println!("-----------------------------------------------");
            println!("[INFO] Event body: {}", encode_payload(&data)?);
        }
        Err(e) => {
            eprintln!("\n[ERROR] Source fetch failed:");
            eprintln!(">>> {}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}
