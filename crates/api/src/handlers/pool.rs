//! Connection pool introspection endpoints: the relational store's pool
//! counters plus the vector store instance pool with per-instance health.

use axum::{extract::State, Extension, Json};

use crate::api_middleware::CorrelationId;
use crate::error::ApiResult;
use crate::state::AppState;

pub async fn metrics(
    State(state): State<AppState>,
    Extension(_correlation): Extension<CorrelationId>,
) -> ApiResult<Json<serde_json::Value>> {
    let db = state.db.pool_metrics();
    let counters = state.orchestrator.counters();

    Ok(Json(serde_json::json!({
        "database": db,
        "vectorPool": {
            "healthyInstances": state.vector_pool.healthy_count(),
            "totalInstances": state.vector_pool.instances().len(),
            "status": state.vector_pool.health(),
        },
        "pipeline": counters,
        "cache": state.cache.stats(),
        "recentEvents": state.orchestrator.recent_history(10),
    })))
}

pub async fn connections(
    State(state): State<AppState>,
    Extension(_correlation): Extension<CorrelationId>,
) -> ApiResult<Json<serde_json::Value>> {
    Ok(Json(serde_json::json!({
        "instances": state.vector_pool.snapshots(),
        "hubConnections": state.hub.connection_count(),
    })))
}
