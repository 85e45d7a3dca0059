//! Health check endpoints

use crate::metrics::GatewayMetrics;
use crate::nats::NatsPublisher;
use crate::shard::ShardManager;
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
    pub name: String,
}

/// Readiness check response
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub started: bool,
    pub shards_total: usize,
    pub shards_ready: usize,
    pub nats_connected: bool,
    pub guilds_total: u64,
}

/// Application state for health endpoints
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ShardManager>,
    pub nats: Option<Arc<NatsPublisher>>,
    pub metrics: GatewayMetrics,
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
        name: state.manager.settings().name.clone(),
    })
}

fn readiness(state: &AppState) -> ReadyResponse {
    let shards = state.manager.snapshot();
    let shards_ready = shards.iter().filter(|s| s.info.ready).count();
    let started = state.manager.started();
    let nats_connected = state.nats.as_ref().map_or(true, |n| n.is_connected());

    ReadyResponse {
        ready: started && shards_ready > 0 && nats_connected,
        started,
        shards_total: shards.len(),
        shards_ready,
        nats_connected,
        guilds_total: shards.iter().map(|s| s.info.guild_count).sum(),
    }
}

/// Readiness endpoint - 200 once started with at least one shard ready
async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    let response = readiness(&state);

    if response.ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Metrics endpoint - returns Prometheus format metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.set_shards_ready(state.manager.ready_count());

    if let Some(ref nats) = state.nats {
        state.metrics.set_nats_connected(nats.is_connected());
    }

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.metrics.render(),
    )
}
