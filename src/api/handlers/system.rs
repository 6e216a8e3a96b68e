//! System endpoints: health check and connection statistics.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;

use crate::api::dto::{HealthResponse, StatsResponse};
use crate::app_state::AppState;

/// `GET /health` — Service health status.
#[utoipa::path(
    get,
    path = "/health",
    tag = "System",
    summary = "Health check",
    description = "Returns 200 while the gateway accepts sessions and 503 once it is draining.",
    responses(
        (status = 200, description = "Service is accepting sessions", body = HealthResponse),
        (status = 503, description = "Service is shutting down", body = HealthResponse),
    )
)]
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let (status, label) = if state.is_accepting() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "draining")
    };
    (
        status,
        Json(HealthResponse {
            status: label.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
    )
}

/// `GET /api/v1/stats` — Online users and live connections.
#[utoipa::path(
    get,
    path = "/api/v1/stats",
    tag = "System",
    summary = "Connection statistics",
    description = "Counts served from the registry's read-only indices; may lag in-flight registrations by one message.",
    responses(
        (status = 200, description = "Current counts", body = StatsResponse),
    )
)]
pub async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatsResponse {
        online_users: state.registry.online_user_count(),
        total_connections: state.registry.connection_count(),
    })
}

/// System routes mounted at the root level (not under /api/v1).
pub fn routes() -> Router<AppState> {
    Router::new().route("/health", get(health_handler))
}
