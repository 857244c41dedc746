//! Detection-rule admin endpoints. Writes are admin-gated upstream (auth
//! is an external collaborator); every successful write invalidates the
//! detector's rule snapshot.

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use sentinel_core::types::{DetectionRule, EventType, RiskLevel};
use sentinel_core::Error;
use sentinel_store::RuleSpec;
use serde::Deserialize;
use validator::Validate;

use crate::api_middleware::CorrelationId;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RuleBody {
    pub event_id: u32,
    #[validate(length(min = 1, max = 128))]
    pub channel: String,
    pub event_type: String,
    pub risk_level: String,
    #[validate(range(min = 0, max = 100))]
    pub confidence: u8,
    #[validate(length(min = 1, max = 512))]
    pub summary: String,
    #[serde(default)]
    pub mitre_techniques: Vec<String>,
    #[serde(default)]
    pub recommended_actions: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

impl RuleBody {
    fn to_spec(&self) -> Result<RuleSpec, Error> {
        self.validate()
            .map_err(|e| Error::validation(e.to_string()))?;
        Ok(RuleSpec {
            event_id: self.event_id,
            channel: self.channel.clone(),
            event_type: EventType::parse(&self.event_type)
                .ok_or_else(|| Error::invalid_input("eventType is not recognized"))?,
            risk_level: RiskLevel::parse(&self.risk_level).ok_or_else(|| {
                Error::invalid_input("riskLevel must be one of critical|high|medium|low")
            })?,
            confidence: self.confidence,
            summary: self.summary.clone(),
            mitre_techniques: self.mitre_techniques.clone(),
            recommended_actions: self.recommended_actions.clone(),
            enabled: self.enabled,
            priority: self.priority,
            tags: self.tags.clone(),
        })
    }
}

pub async fn list_rules(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
) -> ApiResult<Json<Vec<DetectionRule>>> {
    let rules = state
        .rules
        .list_all()
        .await
        .map_err(|e| ApiError::from(e).with_correlation_id(correlation.0.clone()))?;
    Ok(Json(rules))
}

pub async fn create_rule(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Json(body): Json<RuleBody>,
) -> ApiResult<Json<DetectionRule>> {
    let wrap = |e: Error| ApiError::from(e).with_correlation_id(correlation.0.clone());

    let spec = body.to_spec().map_err(&wrap)?;
    let rule = state.rules.create(&spec).await.map_err(&wrap)?;
    state.detector.invalidate().await;
    Ok(Json(rule))
}

pub async fn update_rule(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Path(id): Path<i32>,
    Json(body): Json<RuleBody>,
) -> ApiResult<Json<DetectionRule>> {
    let wrap = |e: Error| ApiError::from(e).with_correlation_id(correlation.0.clone());

    let spec = body.to_spec().map_err(&wrap)?;
    let rule = state.rules.update(id, &spec).await.map_err(&wrap)?;
    state.detector.invalidate().await;
    Ok(Json(rule))
}

pub async fn delete_rule(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Path(id): Path<i32>,
) -> ApiResult<Json<serde_json::Value>> {
    state
        .rules
        .delete(id)
        .await
        .map_err(|e| ApiError::from(e).with_correlation_id(correlation.0.clone()))?;
    state.detector.invalidate().await;
    Ok(Json(serde_json::json!({ "deleted": id })))
}
