//! Health and metrics HTTP surface.
//!
//! `GET /health` returns liveness plus headline numbers.
//! `GET /metrics` returns the full snapshot, per-worker table included.
//! Anything else gets a 404 JSON body.

use crate::ShutdownFlag;
use crate::metrics::MetricsRegistry;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;

#[derive(Clone)]
pub struct HealthState {
    pub metrics: Arc<MetricsRegistry>,
}

pub fn build_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .fallback(fallback_404)
        .with_state(state)
}

/// Serve until the shutdown flag flips.
pub async fn serve(
    listener: tokio::net::TcpListener,
    router: Router,
    shutdown: ShutdownFlag,
) -> Result<(), std::io::Error> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await
}

async fn health(State(state): State<HealthState>) -> impl IntoResponse {
    let snapshot = state.metrics.snapshot();
    Json(json!({
        "status": "ok",
        "uptime": state.metrics.uptime_seconds(),
        "totalInserted": snapshot.total_inserted,
        "throughputEps": snapshot.throughput_eps,
        "activeWorkers": snapshot.active_workers,
    }))
}

async fn metrics(State(state): State<HealthState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

async fn fallback_404() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"code": "NOT_FOUND", "message": "no such endpoint"})),
    )
}
