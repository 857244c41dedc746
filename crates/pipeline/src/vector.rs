//! # Vector Store Client
//!
//! Upserts embeddings and runs similarity search against the external
//! vector database, load-balanced across the pooled instances with
//! automatic failover. Vector ids equal security-event ids (1:1), payloads
//! carry `event_type`, `risk_level` and `timestamp` for server-side
//! filtering, and the collection is asserted at startup with the
//! deployment's fixed dimension and cosine distance.

use async_trait::async_trait;
use sentinel_core::cache::CacheService;
use sentinel_core::config::PoolConfig;
use sentinel_core::error::{Error, ErrorCode, Result};
use sentinel_core::metrics::PipelineMetrics;
use sentinel_core::pool::InstancePool;
use sentinel_core::retry::{retry_transient, Backoff};
use sentinel_core::types::SearchHit;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

/// One embedding bound for upsert.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VectorPoint {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub metadata: HashMap<String, String>,
}

pub struct VectorStoreClient {
    pool: Arc<InstancePool>,
    client: reqwest::Client,
    collection: String,
    dimension: usize,
    auto_create: bool,
    min_similarity_default: f32,
    cache: Arc<CacheService>,
    metrics: PipelineMetrics,
    backoff: Backoff,
}

impl VectorStoreClient {
    pub fn new(
        config: &PoolConfig,
        dimension: usize,
        pool: Arc<InstancePool>,
        cache: Arc<CacheService>,
        metrics: PipelineMetrics,
    ) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connection_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_default();

        Self {
            pool,
            client,
            collection: config.collection.clone(),
            dimension,
            auto_create: config.auto_create_collection,
            min_similarity_default: 0.7,
            cache,
            metrics,
            backoff: Backoff::default(),
        }
    }

    pub fn pool(&self) -> &Arc<InstancePool> {
        &self.pool
    }

    /// Assert the collection exists, creating it when allowed. A missing
    /// collection with auto-create disabled stops the vector subsystem.
    pub async fn ensure_collection(&self) -> Result<()> {
        retry_transient(&self.backoff, || async {
            let lease = self.pool.acquire()?;
            let url = format!("{}/collections/{}", lease.base_url(), self.collection);
            let started = Instant::now();

            let response = self.client.get(&url).send().await;
            match response {
                Ok(response) if response.status().is_success() => {
                    lease.report_success(started.elapsed());
                    Ok(())
                }
                Ok(response) if response.status().as_u16() == 404 => {
                    lease.report_success(started.elapsed());
                    if !self.auto_create {
                        return Err(Error::new(
                            ErrorCode::CollectionMissing,
                            format!("collection '{}' missing and auto-create disabled", self.collection),
                        ));
                    }
                    self.create_collection().await
                }
                Ok(response) => {
                    lease.report_failure();
                    Err(upstream_status(response.status()))
                }
                Err(e) => {
                    lease.report_failure();
                    Err(Error::from(e))
                }
            }
        })
        .await
    }

    async fn create_collection(&self) -> Result<()> {
        let lease = self.pool.acquire()?;
        let url = format!("{}/collections/{}", lease.base_url(), self.collection);
        let started = Instant::now();

        let response = self
            .client
            .put(&url)
            .json(&serde_json::json!({
                "vectors": { "size": self.dimension, "distance": "Cosine" }
            }))
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                lease.report_success(started.elapsed());
                info!(collection = %self.collection, dimension = self.dimension, "vector collection created");
                Ok(())
            }
            Ok(response) => {
                lease.report_failure();
                Err(upstream_status(response.status()))
            }
            Err(e) => {
                lease.report_failure();
                Err(Error::from(e))
            }
        }
    }

    /// Upsert a batch. Instance failures are retried on another instance
    /// per the pool's failover rules; intra-batch order is not preserved by
    /// the server and is explicitly not guaranteed.
    pub async fn upsert_batch(&self, points: &[VectorPoint]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }

        let body = serde_json::json!({
            "points": points.iter().map(|p| serde_json::json!({
                "id": p.id,
                "vector": p.vector,
                "payload": p.metadata,
            })).collect::<Vec<_>>()
        });

        retry_transient(&self.backoff, || async {
            let lease = self.pool.acquire()?;
            let url = format!(
                "{}/collections/{}/points?wait=true",
                lease.base_url(),
                self.collection
            );
            let started = Instant::now();

            match self.client.put(&url).json(&body).send().await {
                Ok(response) if response.status().is_success() => {
                    lease.report_success(started.elapsed());
                    Ok(())
                }
                Ok(response) => {
                    lease.report_failure();
                    Err(upstream_status(response.status()))
                }
                Err(e) => {
                    lease.report_failure();
                    Err(Error::from(e))
                }
            }
        })
        .await
    }

    /// Similarity search, served from the vector-search cache when an
    /// equivalent query is fresh enough.
    pub async fn search(
        &self,
        query: &[f32],
        k: usize,
        min_similarity: Option<f32>,
    ) -> Result<Vec<SearchHit>> {
        let min_similarity = min_similarity.unwrap_or(self.min_similarity_default);
        let key = search_cache_key(query, k, min_similarity);

        if let Some(hits) = self.cache.vector_search.get(&key) {
            self.metrics
                .cache_hits
                .with_label_values(&["vector_search"])
                .inc();
            return Ok(hits);
        }

        // Near-identical query vectors reuse each other's result sets.
        if let Some((neighbor_key, similarity)) = self.cache.search_semantic.nearest(query) {
            if let Some(hits) = self.cache.vector_search.get(&neighbor_key) {
                debug!(similarity, "vector search served via semantic alias");
                self.metrics
                    .cache_hits
                    .with_label_values(&["vector_search_semantic"])
                    .inc();
                return Ok(hits);
            }
        }
        self.metrics
            .cache_misses
            .with_label_values(&["vector_search"])
            .inc();

        let hits = retry_transient(&self.backoff, || async {
            let lease = self.pool.acquire()?;
            let url = format!(
                "{}/collections/{}/points/search",
                lease.base_url(),
                self.collection
            );
            let started = Instant::now();

            let response = self
                .client
                .post(&url)
                .json(&serde_json::json!({
                    "vector": query,
                    "limit": k,
                    "score_threshold": min_similarity,
                    "with_payload": true,
                }))
                .send()
                .await;

            match response {
                Ok(response) if response.status().is_success() => {
                    let body: serde_json::Value = response.json().await.map_err(Error::from)?;
                    lease.report_success(started.elapsed());
                    parse_search_hits(&body)
                }
                Ok(response) => {
                    lease.report_failure();
                    Err(upstream_status(response.status()))
                }
                Err(e) => {
                    lease.report_failure();
                    Err(Error::from(e))
                }
            }
        })
        .await?;

        self.cache.vector_search.put(key.clone(), hits.clone());
        self.cache.search_semantic.insert(key, query.to_vec());
        Ok(hits)
    }

    /// Retention sweep by cutoff; driven by the relational store's
    /// authoritative purge.
    pub async fn delete_before(&self, cutoff: chrono::DateTime<chrono::Utc>) -> Result<()> {
        self.delete_with_body(serde_json::json!({
            "filter": {
                "must": [{ "key": "timestamp", "range": { "lt": cutoff.timestamp() } }]
            }
        }))
        .await
    }

    async fn delete_with_body(&self, body: serde_json::Value) -> Result<()> {
        retry_transient(&self.backoff, || async {
            let lease = self.pool.acquire()?;
            let url = format!(
                "{}/collections/{}/points/delete",
                lease.base_url(),
                self.collection
            );
            let started = Instant::now();

            match self.client.post(&url).json(&body).send().await {
                Ok(response) if response.status().is_success() => {
                    lease.report_success(started.elapsed());
                    Ok(())
                }
                Ok(response) => {
                    lease.report_failure();
                    Err(upstream_status(response.status()))
                }
                Err(e) => {
                    lease.report_failure();
                    Err(Error::from(e))
                }
            }
        })
        .await
    }
}

#[async_trait]
impl sentinel_store::VectorSweep for VectorStoreClient {
    async fn delete_ids(&self, ids: &[Uuid]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.delete_with_body(serde_json::json!({ "points": ids })).await
    }

    async fn delete_before(&self, cutoff: chrono::DateTime<chrono::Utc>) -> Result<()> {
        VectorStoreClient::delete_before(self, cutoff).await
    }
}

fn upstream_status(status: reqwest::StatusCode) -> Error {
    let code = match status.as_u16() {
        429 => ErrorCode::RateLimited,
        s if s >= 500 => ErrorCode::UpstreamError,
        _ => ErrorCode::InvalidInput,
    };
    Error::new(code, format!("vector store returned {}", status))
}

fn parse_search_hits(body: &serde_json::Value) -> Result<Vec<SearchHit>> {
    let results = body
        .get("result")
        .and_then(|r| r.as_array())
        .ok_or_else(|| Error::new(ErrorCode::SerializationError, "malformed search response"))?;

    results
        .iter()
        .map(|hit| {
            let id = hit
                .get("id")
                .and_then(|v| v.as_str())
                .and_then(|s| Uuid::parse_str(s).ok())
                .ok_or_else(|| {
                    Error::new(ErrorCode::SerializationError, "search hit missing id")
                })?;
            let similarity = hit.get("score").and_then(|v| v.as_f64()).unwrap_or(0.0) as f32;
            let metadata = hit
                .get("payload")
                .and_then(|v| v.as_object())
                .map(|obj| {
                    obj.iter()
                        .map(|(k, v)| {
                            let value = v
                                .as_str()
                                .map(str::to_owned)
                                .unwrap_or_else(|| v.to_string());
                            (k.clone(), value)
                        })
                        .collect()
                })
                .unwrap_or_default();

            Ok(SearchHit {
                id,
                similarity,
                metadata,
            })
        })
        .collect()
}

/// Stable cache key for a search query: quantized vector plus parameters.
fn search_cache_key(query: &[f32], k: usize, min_similarity: f32) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    for value in query {
        // Quantize so float noise does not explode the keyspace.
        hasher.update(((value * 10_000.0).round() as i32).to_le_bytes());
    }
    hasher.update(k.to_le_bytes());
    hasher.update(((min_similarity * 1_000.0).round() as i32).to_le_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_cache_key_is_stable_under_float_noise() {
        let a = search_cache_key(&[0.123456, 0.5], 10, 0.7);
        let b = search_cache_key(&[0.1234561, 0.5000001], 10, 0.7);
        assert_eq!(a, b);

        let c = search_cache_key(&[0.2, 0.5], 10, 0.7);
        assert_ne!(a, c);
        let d = search_cache_key(&[0.123456, 0.5], 5, 0.7);
        assert_ne!(a, d);
    }

    #[test]
    fn parse_search_hits_extracts_ids_and_scores() {
        let id = Uuid::new_v4();
        let body = serde_json::json!({
            "result": [
                { "id": id.to_string(), "score": 0.92, "payload": { "risk_level": "high" } }
            ]
        });
        let hits = parse_search_hits(&body).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, id);
        assert!((hits[0].similarity - 0.92).abs() < 1e-6);
        assert_eq!(hits[0].metadata["risk_level"], "high");
    }

    #[test]
    fn malformed_search_response_is_rejected() {
        let err = parse_search_hits(&serde_json::json!({"nope": []})).unwrap_err();
        assert_eq!(err.code, ErrorCode::SerializationError);
    }
}
