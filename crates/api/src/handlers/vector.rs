//! Vector search endpoint: embeds the query text and runs pooled
//! similarity search.

use axum::{extract::State, Extension, Json};
use sentinel_core::Error;
use serde::Deserialize;
use validator::Validate;

use crate::api_middleware::CorrelationId;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct VectorSearchBody {
    #[validate(length(min = 1, max = 8192))]
    pub query: String,
    pub limit: Option<usize>,
    pub similarity_threshold: Option<f32>,
}

pub async fn search(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Json(body): Json<VectorSearchBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let wrap = |e: Error| ApiError::from(e).with_correlation_id(correlation.0.clone());

    body.validate()
        .map_err(|e| wrap(Error::validation(e.to_string())))?;
    if let Some(threshold) = body.similarity_threshold {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(wrap(Error::invalid_input(
                "similarityThreshold must be within 0.0..=1.0",
            )));
        }
    }

    let normalized = sentinel_core::types::normalize_text(&body.query);
    let vector = state.embedding.embed(&normalized).await.map_err(&wrap)?;
    let hits = state
        .vector
        .search(
            &vector,
            body.limit.unwrap_or(10).clamp(1, 100),
            body.similarity_threshold,
        )
        .await
        .map_err(&wrap)?;

    let count = hits.len();
    Ok(Json(serde_json::json!({
        "results": hits,
        "count": count,
    })))
}
