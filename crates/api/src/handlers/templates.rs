//! Notification template administration. Rendering/delivery belongs to the
//! external notifier integrations; this surface only manages the stored
//! templates.

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use sentinel_core::Error;
use sentinel_store::{NotificationTemplate, TemplateSpec};
use serde::Deserialize;
use validator::Validate;

use crate::api_middleware::CorrelationId;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TemplateBody {
    #[validate(length(min = 1, max = 128))]
    pub name: String,
    #[validate(length(min = 1, max = 32))]
    pub channel: String,
    pub subject: Option<String>,
    #[validate(length(min = 1))]
    pub body: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl TemplateBody {
    fn to_spec(&self) -> Result<TemplateSpec, Error> {
        self.validate()
            .map_err(|e| Error::validation(e.to_string()))?;
        Ok(TemplateSpec {
            name: self.name.clone(),
            channel: self.channel.clone(),
            subject: self.subject.clone(),
            body: self.body.clone(),
            enabled: self.enabled,
        })
    }
}

pub async fn list_templates(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
) -> ApiResult<Json<Vec<NotificationTemplate>>> {
    let templates = state
        .templates
        .list()
        .await
        .map_err(|e| ApiError::from(e).with_correlation_id(correlation.0.clone()))?;
    Ok(Json(templates))
}

pub async fn create_template(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Json(body): Json<TemplateBody>,
) -> ApiResult<Json<NotificationTemplate>> {
    let wrap = |e: Error| ApiError::from(e).with_correlation_id(correlation.0.clone());
    let spec = body.to_spec().map_err(&wrap)?;
    let template = state.templates.create(&spec).await.map_err(&wrap)?;
    Ok(Json(template))
}

pub async fn update_template(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Path(id): Path<i32>,
    Json(body): Json<TemplateBody>,
) -> ApiResult<Json<NotificationTemplate>> {
    let wrap = |e: Error| ApiError::from(e).with_correlation_id(correlation.0.clone());
    let spec = body.to_spec().map_err(&wrap)?;
    let template = state.templates.update(id, &spec).await.map_err(&wrap)?;
    Ok(Json(template))
}

pub async fn delete_template(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Path(id): Path<i32>,
) -> ApiResult<Json<serde_json::Value>> {
    state
        .templates
        .delete(id)
        .await
        .map_err(|e| ApiError::from(e).with_correlation_id(correlation.0.clone()))?;
    Ok(Json(serde_json::json!({ "deleted": id })))
}
