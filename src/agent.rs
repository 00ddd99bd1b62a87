//! The agent: dials out to the proxy, heartbeats, long-polls for work and
//! performs the actual scrapes against the local target.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use reqwest::StatusCode;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::wire::{ProxyRequest, ProxyResponse, PullRequest};

/// Delay before re-polling after a transport error or an unexpected status.
const RETRY_DELAY: Duration = Duration::from_secs(5);

pub struct Agent {
    id: String,
    config: AgentConfig,
    http: reqwest::Client,
}

impl Agent {
    /// Mint a fresh identity and build the HTTP client. The proxy never
    /// invents identities; this UUID is the only name the agent goes by.
    pub fn new(config: AgentConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(format!("scrape-relay-agent/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            id: Uuid::new_v4().to_string(),
            config,
            http,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run the heartbeat loop and the work-poll loop until the process is
    /// stopped. Scrape workers are spawned per work item so a slow target
    /// never stalls polling.
    pub async fn run(self) -> Result<()> {
        info!("Agent {} connecting to {}", self.id, self.config.proxy_url);

        let agent = Arc::new(self);
        let heartbeat = Arc::clone(&agent);
        tokio::spawn(async move { heartbeat.heartbeat_loop().await });

        agent.poll_loop().await
    }

    async fn heartbeat_loop(&self) {
        loop {
            debug!("Sending heartbeat for {}", self.id);
            if let Err(e) = self.push(&ProxyResponse::heartbeat(&self.id)).await {
                warn!("Failed to send heartbeat: {}", e);
            }
            sleep(self.config.heartbeat_interval).await;
        }
    }

    async fn poll_loop(self: Arc<Self>) -> Result<()> {
        loop {
            let response = match self
                .http
                .post(self.config.pull_url())
                .json(&PullRequest {
                    id: self.id.clone(),
                })
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    warn!("Failed to poll for scrape requests: {}", e);
                    sleep(RETRY_DELAY).await;
                    continue;
                }
            };

            match response.status() {
                // An idle long-poll; re-poll immediately.
                StatusCode::GATEWAY_TIMEOUT => continue,
                // 404: the proxy has forgotten us; the next heartbeat
                // re-registers. 5xx: transient proxy trouble.
                status if status == StatusCode::NOT_FOUND || status.is_server_error() => {
                    debug!("No scrape requests available ({})", status);
                    sleep(RETRY_DELAY).await;
                    continue;
                }
                _ => {}
            }

            let work: ProxyRequest = match response.json().await {
                Ok(work) => work,
                Err(e) => {
                    warn!("Failed to parse scrape request: {}", e);
                    continue;
                }
            };

            let worker = Arc::clone(&self);
            tokio::spawn(async move { worker.scrape(work).await });
        }
    }

    /// Perform one scrape and push its result. Exactly one result is
    /// emitted per work item.
    async fn scrape(&self, work: ProxyRequest) {
        let Some(uri) = work.scrape_requests.get(&self.id) else {
            debug!("Ignoring work item without an entry for {}", self.id);
            return;
        };

        let target = rewrite_target(uri, &self.id, &self.config.remote_fqdn);
        debug!("Performing scrape request against {}", target);

        let result = match self.fetch(&target).await {
            Ok(body) => ProxyResponse::success(&self.id, body),
            Err(e) => {
                warn!("Scrape request against {} failed: {}", target, e);
                ProxyResponse::failure(&self.id, e.to_string())
            }
        };

        if let Err(e) = self.push(&result).await {
            warn!("Failed to deliver scrape result: {}", e);
        }
    }

    async fn fetch(&self, target: &str) -> Result<String> {
        let response = self.http.get(target).send().await?;
        Ok(response.text().await?)
    }

    async fn push(&self, result: &ProxyResponse) -> Result<()> {
        self.http
            .post(self.config.push_url())
            .json(result)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Replace the agent-id sentinel in a proxied URI with the host the scrape
/// should actually reach.
fn rewrite_target(uri: &str, id: &str, remote_fqdn: &str) -> String {
    uri.replace(id, remote_fqdn)
}
