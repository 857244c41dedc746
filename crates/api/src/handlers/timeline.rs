//! Timeline aggregation endpoints. Bucketing happens at the store via
//! `date_trunc`; this layer only validates parameters.

use axum::{
    extract::{Query, State},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use sentinel_core::types::{EventType, RiskLevel};
use sentinel_core::Error;
use sentinel_store::{EventFilter, Granularity};
use serde::Deserialize;

use crate::api_middleware::CorrelationId;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineQuery {
    pub granularity: String,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Comma-separated list
    pub event_types: Option<String>,
    /// Comma-separated list
    pub risk_levels: Option<String>,
}

pub async fn timeline(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Query(query): Query<TimelineQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let wrap = |e: Error| ApiError::from(e).with_correlation_id(correlation.0.clone());

    let granularity = Granularity::parse(&query.granularity).ok_or_else(|| {
        wrap(Error::invalid_input(
            "granularity must be one of minute|hour|day|week|month",
        ))
    })?;

    let mut filter = EventFilter {
        date_from: query.from,
        date_to: query.to,
        ..EventFilter::default()
    };
    if let Some(types) = &query.event_types {
        filter.event_types = parse_list(types, EventType::parse)
            .map_err(|name| wrap(Error::invalid_input(format!("unknown eventType '{}'", name))))?;
    }
    if let Some(risks) = &query.risk_levels {
        filter.risk_levels = parse_list(risks, RiskLevel::parse)
            .map_err(|name| wrap(Error::invalid_input(format!("unknown riskLevel '{}'", name))))?;
    }

    let buckets = state
        .events
        .timeline(granularity, &filter)
        .await
        .map_err(&wrap)?;
    let total: i64 = buckets.iter().map(|b| b.count).sum();

    Ok(Json(serde_json::json!({ "data": buckets, "total": total })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineStatsQuery {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

pub async fn timeline_stats(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Query(query): Query<TimelineStatsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let wrap = |e: Error| ApiError::from(e).with_correlation_id(correlation.0.clone());

    if query.end_time <= query.start_time {
        return Err(wrap(Error::invalid_input("endTime must be after startTime")));
    }

    let stats = state
        .events
        .timeline_stats(query.start_time, query.end_time)
        .await
        .map_err(&wrap)?;
    Ok(Json(serde_json::to_value(stats).map_err(|e| wrap(e.into()))?))
}

fn parse_list<T>(input: &str, parse: fn(&str) -> Option<T>) -> Result<Vec<T>, String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|name| parse(name).ok_or_else(|| name.to_string()))
        .collect()
}
