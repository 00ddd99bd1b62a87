//! Prometheus metrics for the proxy, exported through the `/metrics` route.

use std::sync::OnceLock;

use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Gauge: agents currently within their registration window.
pub const ACTIVE_AGENTS: &str = "scrape_relay_active_agents";
/// Counter: HTTP API requests, labelled by `path` and `code`.
pub const HTTP_REQUESTS: &str = "scrape_relay_http_requests_total";
/// Counter: proxied scrape requests, labelled by `code`.
pub const PROXIED_REQUESTS: &str = "scrape_relay_proxied_requests_total";

static PROMETHEUS: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder (once per process) and return a
/// handle that renders the exposition text.
pub fn prometheus_handle() -> PrometheusHandle {
    PROMETHEUS
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("Failed to install Prometheus recorder");

            describe_gauge!(
                ACTIVE_AGENTS,
                "The number of clients that are currently connected"
            );
            describe_counter!(HTTP_REQUESTS, "Number of http api requests");
            describe_counter!(PROXIED_REQUESTS, "Number of http proxy requests");

            handle
        })
        .clone()
}
