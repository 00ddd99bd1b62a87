use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use crate::{
    config::ProxyConfig,
    error::{AppError, Result},
    metrics::{ACTIVE_AGENTS, HTTP_REQUESTS, PROXIED_REQUESTS},
    registry::{start_sweeper, Registry},
    wire::{ProxyRequest, ProxyResponse, PullRequest},
};

#[derive(Clone)]
pub struct AppState {
    pub config: ProxyConfig,
    pub registry: Arc<Registry>,
    pub prometheus: PrometheusHandle,
}

/// Service-discovery entry for one agent, as consumed by the monitoring
/// server's HTTP SD mechanism.
#[derive(Debug, Serialize)]
struct TargetGroup {
    targets: Vec<String>,
    labels: HashMap<String, String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/clients", get(list_clients))
        .route("/metrics", get(render_metrics))
        .route("/push", post(push))
        .route("/pull", post(pull))
        .layer(RequestBodyLimitLayer::new(1024 * 1024)) // 1 MiB
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn_with_state(state.clone(), dispatch))
        .with_state(state)
}

pub async fn run_server(config: ProxyConfig) -> anyhow::Result<()> {
    let prometheus = crate::metrics::prometheus_handle();
    let registry = Arc::new(Registry::new(config.registration_timeout));
    start_sweeper(Arc::clone(&registry));

    let state = AppState {
        config: config.clone(),
        registry,
        prometheus,
    };

    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!("Proxy listening on {}", listener.local_addr()?);

    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Discriminate between proxied scrapes and plain API requests before
/// routing: monitoring servers configured to use the proxy send
/// absolute-form request targets, which carry a host component.
async fn dispatch(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if request.uri().host().is_some() {
        let response = proxy_scrape(state, request)
            .await
            .unwrap_or_else(IntoResponse::into_response);
        counter!(PROXIED_REQUESTS, "code" => response.status().as_u16().to_string()).increment(1);
        response
    } else {
        let path = request.uri().path().to_string();
        let response = next.run(request).await;
        counter!(
            HTTP_REQUESTS,
            "path" => path,
            "code" => response.status().as_u16().to_string()
        )
        .increment(1);
        response
    }
}

/// Logs scrape handlers that are dropped before a result arrives (the
/// monitoring server hung up or cancelled the request).
struct AbandonLog {
    target: String,
    armed: bool,
}

impl AbandonLog {
    fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for AbandonLog {
    fn drop(&mut self) {
        if self.armed {
            warn!(
                "Scrape request for client {} closed before a result arrived",
                self.target
            );
        }
    }
}

/// The proxied scrape: enqueue the request as work for the target agent and
/// block until the agent pushes back a result.
async fn proxy_scrape(state: AppState, request: Request) -> Result<Response> {
    let target = request.uri().host().unwrap_or_default().to_string();
    let request_uri = request.uri().to_string();

    if !state.registry.is_available(&target) {
        warn!("Ignoring scrape request for unregistered client {}", target);
        return Err(AppError::UnknownAgent(request_uri));
    }

    debug!("Sending scrape request to client {}", target);
    state
        .registry
        .enqueue_work(&target, ProxyRequest::for_target(&target, &request_uri));

    let mut abandon_log = AbandonLog::new(&target);
    let result = state.registry.await_result(&target).await;
    abandon_log.disarm();

    let Some(result) = result else {
        // The record was swept away while we waited; its queues are gone.
        return Err(AppError::MissingQueue(request_uri));
    };

    if let Some(message) = result.errors.get(&target) {
        warn!("Scrape request failed on client {}: {}", target, message);
        return Ok((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": message })),
        )
            .into_response());
    }

    if let Some(payload) = result.payload.get(&target) {
        debug!(
            "Scrape request for client {} returned {} bytes",
            target,
            payload.len()
        );
        return Ok(payload.clone().into_response());
    }

    error!("Client {} returned neither a payload nor an error", target);
    Ok(StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Agent delivery endpoint: scrape results are forwarded to the waiting
/// scrape handler, heartbeats refresh the agent's registration.
async fn push(State(state): State<AppState>, body: Bytes) -> Result<StatusCode> {
    let result: ProxyResponse = serde_json::from_slice(&body)?;
    let id = result.id.clone();

    if result.is_heartbeat() {
        state.registry.register(&id);
        gauge!(ACTIVE_AGENTS).set(state.registry.live_agents().len() as f64);
        debug!("Received heartbeat from client {}", id);
    } else if state.registry.deliver_result(&id, result) {
        debug!("Forwarded scrape result from client {}", id);
    } else {
        // No handler is waiting for this result; the monitoring server gave
        // up or timed out, so the result is discarded.
        debug!("Dropping scrape result from client {}", id);
    }

    Ok(StatusCode::OK)
}

/// Agent long-poll endpoint: wait for the next work item until one arrives,
/// the poll timeout elapses, or the agent hangs up.
async fn pull(State(state): State<AppState>, body: Bytes) -> Result<Response> {
    let request: PullRequest = serde_json::from_slice(&body)?;
    let id = request.id;

    if !state.registry.is_available(&id) {
        warn!("Pull request from unregistered client {}", id);
        return Err(AppError::UnknownAgent(id));
    }

    debug!("Client {} is waiting for a scrape request", id);

    tokio::select! {
        work = state.registry.next_work(&id) => match work {
            Some(work) => {
                debug!("Scrape request handed to client {}", id);
                Ok(Json(work).into_response())
            }
            None => Err(AppError::MissingQueue(id.clone())),
        },
        _ = tokio::time::sleep(state.config.poll_timeout) => {
            debug!("Poll timeout reached for client {}, closing the long poll", id);
            Ok(StatusCode::GATEWAY_TIMEOUT.into_response())
        }
    }
}

async fn list_clients(State(state): State<AppState>) -> Json<Vec<TargetGroup>> {
    let groups = state
        .registry
        .live_agents()
        .into_iter()
        .map(|id| TargetGroup {
            targets: vec![id],
            labels: HashMap::new(),
        })
        .collect();
    Json(groups)
}

async fn render_metrics(State(state): State<AppState>) -> String {
    state.prometheus.render()
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "scrape-relay",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "active_clients": state.registry.live_agents().len(),
    }))
}
