//! Health check endpoints
//!
//! `/ready` round-trips a `PING` on the global shard, so it reflects the
//! broker as well as the registry lifecycle.

use crate::metrics::PoolMetrics;
use crate::shard::ShardRegistry;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on the readiness `PING`
pub const READY_PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub shards_total: usize,
}

/// Readiness check response
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub shards: Vec<String>,
    pub global_reachable: bool,
    pub subscribers: usize,
}

/// Application state for health endpoints
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ShardRegistry>,
    pub metrics: Option<Arc<PoolMetrics>>,
}

/// Create the health check router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Health endpoint - always returns 200 if process is running
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        shards_total: state.registry.shard_count(),
    })
}

/// Readiness endpoint - 200 when initialized and the global shard answers
async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    let global_reachable = match state.registry.acquire_shard_connection(None) {
        Ok(global) => matches!(
            tokio::time::timeout(READY_PING_TIMEOUT, global.ping()).await,
            Ok(Ok(()))
        ),
        Err(_) => false,
    };

    let response = ReadyResponse {
        ready: global_reachable,
        shards: state.registry.shard_ids(),
        global_reachable,
        subscribers: state.registry.subscriber_count(),
    };

    if response.ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Metrics endpoint - returns Prometheus format metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    crate::metrics::set_shards_registered(state.registry.shard_count());
    crate::metrics::set_subscribers_active(state.registry.subscriber_count());

    let body = state
        .metrics
        .as_ref()
        .map(|metrics| metrics.render())
        .unwrap_or_default();

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
}
