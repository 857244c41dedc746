//! Consolidated dashboard endpoints.

use axum::{
    extract::{Query, State},
    Extension, Json,
};
use sentinel_core::types::{DashboardSnapshot, TimeRange};
use sentinel_core::Error;
use serde::Deserialize;

use crate::api_middleware::CorrelationId;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardQuery {
    pub time_range: Option<String>,
}

pub async fn consolidated(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Query(query): Query<DashboardQuery>,
) -> ApiResult<Json<DashboardSnapshot>> {
    let wrap = |e: Error| ApiError::from(e).with_correlation_id(correlation.0.clone());

    let range = match query.time_range.as_deref() {
        None => TimeRange::Day,
        Some(raw) => TimeRange::parse(raw).ok_or_else(|| {
            wrap(Error::invalid_input("timeRange must be one of 1h|24h|7d|30d"))
        })?,
    };

    let snapshot = state.dashboard.snapshot_for(range).await.map_err(&wrap)?;
    Ok(Json(snapshot))
}

/// `POST /api/dashboarddata/broadcast`: push a fresh snapshot through the
/// hub immediately, bypassing the debounce.
pub async fn broadcast(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
) -> ApiResult<Json<serde_json::Value>> {
    let snapshot = state
        .dashboard
        .snapshot_for(TimeRange::Day)
        .await
        .map_err(|e| ApiError::from(e).with_correlation_id(correlation.0.clone()))?;

    state.hub.dashboard_update(&snapshot);
    Ok(Json(serde_json::json!({
        "broadcast": true,
        "connectedClients": state.hub.connection_count(),
    })))
}
