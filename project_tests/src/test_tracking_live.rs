//! # 17TRACK Live Fetch
//!
//! Fetches one tracking number from the real API through lib_common and
//! prints the outcome. Needs `TRACK17_API_KEY` (a `.env` file works too).

use clap::Parser;
use lib_common::tracking::{FetchResult, TrackingClient, TrackingClientConfig};
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(about = "Fetch one tracking number from the 17TRACK API")]
struct Args {
    /// Tracking number to look up.
    tracking_number: String,

    #[clap(long, env = "TRACK17_API_KEY")]
    api_key: String,

    #[clap(long, env = "TRACK17_API_URL")]
    api_url: Option<String>,

    #[clap(long, default_value_t = 10)]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = TrackingClientConfig::new(args.api_key);
    config.timeout = Duration::from_secs(args.timeout_secs);
    if let Some(url) = args.api_url {
        config.base_url = url;
    }
    let client = TrackingClient::new(config)?;

    println!("[*] Requesting {} from 17TRACK...", args.tracking_number);
    let outcome: FetchResult = client.fetch_one(&args.tracking_number).await;
    client.close();

    match outcome {
        Ok(record) => {
            println!("\n[SUCCESS] Data received:");
            println!("-----------------------------------------------");
            println!("{}", serde_json::to_string_pretty(&record)?);
            println!("-----------------------------------------------");
            println!("[INFO] Delivered: {}", record.is_delivered());
        }
        Err(e) => {
            eprintln!("\n[ERROR] Fetch failed ({}):", e.kind);
            eprintln!(">>> {}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}
