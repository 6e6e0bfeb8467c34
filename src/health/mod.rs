//! Health check endpoints

use crate::bus::InputSubscriber;
use crate::metrics::{self, CoordinatorMetrics};
use crate::observer::ObserverHandle;
use crate::shard::{ShardState, ShardSummary};
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub instance_id: String,
}

/// Readiness check response
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub instance_id: String,
    pub subscriber_connected: bool,
    pub store_degraded: bool,
    pub shards_total: usize,
    pub shards_probing: usize,
    pub connections_total: usize,
    pub guest_connections: i64,
}

/// Application state for health endpoints
#[derive(Clone)]
pub struct AppState {
    pub shard_state: ShardState,
    pub subscriber: Arc<InputSubscriber>,
    pub observer: ObserverHandle,
    pub metrics: CoordinatorMetrics,
}

/// Create the health check router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/shards", get(shards_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Health endpoint - always returns 200 if process is running
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        instance_id: state.shard_state.instance_id().to_string(),
    })
}

/// Ready when the input channel is subscribed and presence is persisted
pub fn readiness(
    shard_state: &ShardState,
    subscriber_connected: bool,
    store_degraded: bool,
    guest_connections: i64,
) -> ReadyResponse {
    ReadyResponse {
        ready: subscriber_connected && !store_degraded,
        instance_id: shard_state.instance_id().to_string(),
        subscriber_connected,
        store_degraded,
        shards_total: shard_state.shard_count(),
        shards_probing: shard_state.probing_shards(),
        connections_total: shard_state.total_connections(),
        guest_connections,
    }
}

async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    let response = readiness(
        &state.shard_state,
        state.subscriber.is_connected(),
        state.observer.is_degraded(),
        state.observer.total_guest_connections(),
    );

    if response.ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Per-shard keepalive phase and connection counts
async fn shards_handler(State(state): State<AppState>) -> Json<Vec<ShardSummary>> {
    Json(state.shard_state.summaries())
}

/// Metrics endpoint - returns Prometheus format metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    // Refresh gauges that are not updated on the hot path
    metrics::set_subscriber_connected(state.subscriber.is_connected());
    metrics::set_guest_connections(state.observer.total_guest_connections());

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.metrics.render(),
    )
}
