//! # Health Endpoints
//!
//! - `/health`: liveness, always 200 while the process runs.
//! - `/ready`: readiness, verifies the relational store and reports the
//!   vector pool; 503 when a required dependency is down.
//! - `/api/system-status`: per-component health consumed by the dashboard.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use sentinel_core::types::ComponentHealth;
use tracing::error;

use crate::state::AppState;

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "sentinel-server",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let database_ok = match state.db.health_check().await {
        Ok(()) => true,
        Err(e) => {
            error!(error = %e, "readiness: relational store unreachable");
            false
        }
    };
    let vector_status = state.vector_pool.health();

    let ready = database_ok && vector_status != ComponentHealth::Unhealthy;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(serde_json::json!({
            "ready": ready,
            "database": if database_ok { "up" } else { "down" },
            "vectorStore": vector_status,
        })),
    )
}

pub async fn system_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!(state.components.system_status()))
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics_service.get_metrics()
}
