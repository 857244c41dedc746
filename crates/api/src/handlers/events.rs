//! Security-event endpoints: paged listing with filters, single fetch, and
//! the operator PATCH for notes/status.

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use sentinel_core::types::{EventStatus, EventType, RiskLevel, SecurityEvent};
use sentinel_core::Error;
use sentinel_store::{EventFilter, EventPatch};
use serde::Deserialize;
use uuid::Uuid;

use crate::api_middleware::CorrelationId;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EventListQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub risk_level: Option<String>,
    pub event_type: Option<String>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    #[serde(rename = "sourceIP")]
    pub source_ip: Option<String>,
    pub user: Option<String>,
    pub computer: Option<String>,
    pub search: Option<String>,
}

impl EventListQuery {
    fn to_filter(&self) -> Result<EventFilter, Error> {
        let mut filter = EventFilter {
            date_from: self.date_from,
            date_to: self.date_to,
            host: self.computer.clone(),
            user: self.user.clone(),
            source_ip: self.source_ip.clone(),
            text: self.search.clone(),
            ..EventFilter::default()
        };
        if let Some(risk) = &self.risk_level {
            filter.risk_levels = vec![RiskLevel::parse(risk).ok_or_else(|| {
                Error::invalid_input("riskLevel must be one of critical|high|medium|low")
            })?];
        }
        if let Some(event_type) = &self.event_type {
            filter.event_types = vec![EventType::parse(event_type)
                .ok_or_else(|| Error::invalid_input("eventType is not recognized"))?];
        }
        Ok(filter)
    }
}

pub async fn list_events(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Query(query): Query<EventListQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(25).clamp(1, 500);
    let filter = query
        .to_filter()
        .map_err(|e| ApiError::from(e).with_correlation_id(correlation.0.clone()))?;

    let (events, total) = state
        .events
        .query(&filter, page, limit)
        .await
        .map_err(|e| ApiError::from(e).with_correlation_id(correlation.0.clone()))?;

    let total_pages = (total as u64).div_ceil(limit as u64);
    Ok(Json(serde_json::json!({
        "data": events,
        "total": total,
        "page": page,
        "perPage": limit,
        "totalPages": total_pages,
    })))
}

pub async fn get_event(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SecurityEvent>> {
    let event = state
        .events
        .get(id)
        .await
        .map_err(|e| ApiError::from(e).with_correlation_id(correlation.0.clone()))?
        .ok_or_else(|| {
            ApiError::from(Error::not_found(format!("security event {} not found", id)))
                .with_correlation_id(correlation.0.clone())
        })?;
    Ok(Json(event))
}

#[derive(Debug, Deserialize)]
pub struct EventPatchBody {
    pub notes: Option<String>,
    pub status: Option<String>,
}

pub async fn patch_event(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Path(id): Path<Uuid>,
    Json(body): Json<EventPatchBody>,
) -> ApiResult<Json<SecurityEvent>> {
    let status = body
        .status
        .as_deref()
        .map(|s| {
            EventStatus::parse(s).ok_or_else(|| {
                Error::invalid_input("status must be one of open|investigating|resolved")
            })
        })
        .transpose()
        .map_err(|e| ApiError::from(e).with_correlation_id(correlation.0.clone()))?;

    let patch = EventPatch {
        notes: body.notes,
        status,
    };
    let event = state
        .events
        .update(id, &patch)
        .await
        .map_err(|e| ApiError::from(e).with_correlation_id(correlation.0.clone()))?;
    Ok(Json(event))
}
