use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use scrape_relay::{config::ProxyConfig, server::run_server};
use tracing::info;

#[derive(Parser)]
#[command(name = "scrape-relay-proxy")]
#[command(about = "Reverse scrape proxy for pull-based monitoring")]
struct Args {
    /// The endpoint to listen to for HTTP proxy requests
    #[arg(long, default_value = "0.0.0.0:8080")]
    web_url: String,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Seconds since the last heartbeat for which a client is considered connected
    #[arg(long, default_value = "30")]
    timeout: u64,

    /// Seconds a client waiting for a scrape request is held before timing out
    #[arg(long, default_value = "15")]
    poll_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .init();

    info!("Starting scrape-relay proxy");
    info!("Listen address: {}", args.web_url);
    info!(
        "Registration timeout: {}s, poll timeout: {}s",
        args.timeout, args.poll_timeout
    );

    let config = ProxyConfig {
        listen_addr: args.web_url,
        registration_timeout: Duration::from_secs(args.timeout),
        poll_timeout: Duration::from_secs(args.poll_timeout),
    };

    run_server(config).await
}
