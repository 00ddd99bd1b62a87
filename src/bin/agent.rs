use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use scrape_relay::{agent::Agent, config::AgentConfig};
use tracing::info;

#[derive(Parser)]
#[command(name = "scrape-relay-agent")]
#[command(about = "Outbound-only scrape agent for targets the monitoring server cannot reach")]
struct Args {
    /// The proxy endpoint
    #[arg(long, default_value = "http://localhost:8080")]
    proxy_url: String,

    /// FQDN to forward the scrape requests to
    #[arg(long, default_value = "localhost")]
    remote_fqdn: String,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Heartbeat interval in seconds
    #[arg(long, default_value = "10")]
    heartbeat: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .init();

    info!("Starting scrape-relay agent");

    let config = AgentConfig {
        proxy_url: args.proxy_url,
        remote_fqdn: args.remote_fqdn,
        heartbeat_interval: Duration::from_secs(args.heartbeat),
    };

    Agent::new(config).run().await
}
