//! Correlation endpoints: statistics, rule administration, listing, and
//! on-demand re-analysis of recent events.

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use sentinel_core::types::{Correlation, CorrelationRule, CorrelationType};
use sentinel_core::Error;
use sentinel_store::{CorrelationFilter, EventFilter};
use serde::Deserialize;

use crate::api_middleware::CorrelationId;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub async fn statistics(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
) -> ApiResult<Json<serde_json::Value>> {
    let stats = state
        .correlations
        .statistics()
        .await
        .map_err(|e| ApiError::from(e).with_correlation_id(correlation.0.clone()))?;
    let mut value = serde_json::to_value(stats)
        .map_err(|e| ApiError::from(Error::from(e)).with_correlation_id(correlation.0.clone()))?;
    value["activeKeys"] = serde_json::json!(state.engine.active_keys());
    Ok(Json(value))
}

pub async fn list_rules(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<CorrelationRule>>> {
    Ok(Json(state.engine.rules()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationRuleBody {
    pub time_window_secs: Option<u64>,
    pub min_event_count: Option<usize>,
    pub min_confidence: Option<f64>,
    pub enabled: Option<bool>,
}

pub async fn update_rule(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Path(id): Path<String>,
    Json(body): Json<CorrelationRuleBody>,
) -> ApiResult<Json<CorrelationRule>> {
    let wrap = |e: Error| ApiError::from(e).with_correlation_id(correlation.0.clone());

    let mut rule = state
        .engine
        .rules()
        .into_iter()
        .find(|r| r.id == id)
        .ok_or_else(|| wrap(Error::not_found(format!("correlation rule '{}' not found", id))))?;

    if let Some(window) = body.time_window_secs {
        if window == 0 {
            return Err(wrap(Error::invalid_input("timeWindowSecs must be positive")));
        }
        rule.time_window_secs = window;
    }
    if let Some(count) = body.min_event_count {
        if count == 0 {
            return Err(wrap(Error::invalid_input("minEventCount must be positive")));
        }
        rule.min_event_count = count;
    }
    if let Some(confidence) = body.min_confidence {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(wrap(Error::invalid_input(
                "minConfidence must be within 0.0..=1.0",
            )));
        }
        rule.min_confidence = confidence;
    }
    if let Some(enabled) = body.enabled {
        rule.enabled = enabled;
    }

    state.engine.update_rule(rule.clone()).map_err(&wrap)?;
    Ok(Json(rule))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationListQuery {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(rename = "type")]
    pub correlation_type: Option<String>,
    pub min_confidence: Option<f64>,
    pub limit: Option<u32>,
}

pub async fn list_correlations(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Query(query): Query<CorrelationListQuery>,
) -> ApiResult<Json<Vec<Correlation>>> {
    let wrap = |e: Error| ApiError::from(e).with_correlation_id(correlation.0.clone());

    let correlation_type = query
        .correlation_type
        .as_deref()
        .map(|raw| {
            CorrelationType::parse(raw)
                .ok_or_else(|| wrap(Error::invalid_input("unknown correlation type")))
        })
        .transpose()?;

    let filter = CorrelationFilter {
        start_time: query.start_time,
        end_time: query.end_time,
        correlation_type,
        min_confidence: query.min_confidence,
        limit: query.limit,
    };
    let correlations = state.correlations.query(&filter).await.map_err(&wrap)?;
    Ok(Json(correlations))
}

/// `POST /api/correlation/analyze`: replay recent persisted events through
/// the engine's windows (useful after rule changes).
pub async fn analyze(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
) -> ApiResult<Json<serde_json::Value>> {
    let wrap = |e: Error| ApiError::from(e).with_correlation_id(correlation.0.clone());

    let filter = EventFilter {
        date_from: Some(Utc::now() - chrono::Duration::hours(1)),
        ..EventFilter::default()
    };
    let (events, _total) = state.events.query(&filter, 1, 500).await.map_err(&wrap)?;
    let replayed = events.len();

    // Oldest first so windows grow in event order.
    for event in events.into_iter().rev() {
        state.engine.handle_event(&event).await;
    }

    Ok(Json(serde_json::json!({ "replayed": replayed })))
}
