use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::state::AppState;

/// `GET /health` - overall health: process up and store reachable.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match state.repos.probe.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "database": "up" })),
        ),
        Err(e) => {
            tracing::error!(error = %e, "health check: database unreachable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded", "database": "down" })),
            )
        }
    }
}

/// `GET /health/ready` - ready to serve: store reachable and at least one
/// upstream adapter registered.
pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    if state.registry.is_empty() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "ready": false, "reason": "no upstream adapters" })),
        );
    }
    match state.repos.probe.ping().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "ready": true }))),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "ready": false, "reason": "database unreachable" })),
        ),
    }
}

/// `GET /health/live` - trivial liveness.
pub async fn live() -> impl IntoResponse {
    Json(json!({ "alive": true }))
}

/// `GET /health/stats` - operational counters: quota consumer, cache,
/// uptime.
pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let consumer = state.consumer.stats().await;
    let cache = state.cache.stats();

    Json(json!({
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "quota_consumer": consumer,
        "cache": cache,
    }))
}
