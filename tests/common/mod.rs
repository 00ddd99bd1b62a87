//! Shared helpers for the proxy integration tests.

use std::sync::Arc;
use std::time::Duration;

use scrape_relay::{
    config::ProxyConfig,
    metrics,
    registry::Registry,
    server::{app, AppState},
};

/// Bind the proxy router on an ephemeral port and return its base URL.
pub async fn start_proxy(registration_timeout: Duration, poll_timeout: Duration) -> String {
    let config = ProxyConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        registration_timeout,
        poll_timeout,
    };
    let state = AppState {
        registry: Arc::new(Registry::new(config.registration_timeout)),
        prometheus: metrics::prometheus_handle(),
        config,
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app(state)).await.unwrap();
    });

    format!("http://{}", addr)
}

/// A client that routes plain http requests through the proxy, the way a
/// monitoring server doing HTTP proxying sends absolute-form targets.
pub fn proxied_client(proxy_url: &str) -> reqwest::Client {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(proxy_url).unwrap())
        .build()
        .unwrap()
}
