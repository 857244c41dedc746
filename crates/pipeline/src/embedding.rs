//! # Embedding Stage
//!
//! Turns an event's canonical text into a fixed-dimension vector through an
//! HTTP embedding provider, cache-first:
//!
//! 1. exact probe on the normalized-text hash;
//! 2. on miss, single-flight guards the provider call so equal keys share
//!    one request;
//! 3. the fresh vector is checked against the semantic alias index; a
//!    cached neighbor at or above the cosine threshold is reused (and the
//!    new key aliased to it) so near-duplicate events converge on one
//!    stored vector.
//!
//! Entries live 60 minutes by default, extended on access.

use sentinel_core::cache::CacheService;
use sentinel_core::config::EmbeddingConfig;
use sentinel_core::error::{Error, ErrorCode, Result};
use sentinel_core::metrics::PipelineMetrics;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

pub struct EmbeddingClient {
    client: reqwest::Client,
    config: EmbeddingConfig,
    cache: Arc<CacheService>,
    metrics: PipelineMetrics,
}

impl EmbeddingClient {
    pub fn new(
        config: EmbeddingConfig,
        cache: Arc<CacheService>,
        metrics: PipelineMetrics,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_default();

        Self {
            client,
            config,
            cache,
            metrics,
        }
    }

    pub fn dimension(&self) -> usize {
        self.config.dimension
    }

    /// Embed normalized text, cache-first with single-flight.
    pub async fn embed(&self, normalized_text: &str) -> Result<Vec<f32>> {
        if normalized_text.trim().is_empty() {
            return Err(Error::new(
                ErrorCode::InvalidInput,
                "cannot embed empty canonical text",
            ));
        }

        let key = sentinel_core::types::text_hash(normalized_text);

        let cache = Arc::clone(&self.cache);
        let probe_key = key.clone();
        self.cache
            .single_flight
            .run(
                &key,
                move || cache.embedding.get(&probe_key),
                || self.fetch_and_reconcile(normalized_text, &key),
            )
            .await
    }

    /// Provider call plus semantic reconciliation.
    async fn fetch_and_reconcile(&self, text: &str, key: &str) -> Result<Vec<f32>> {
        self.metrics
            .cache_misses
            .with_label_values(&["embedding"])
            .inc();

        let vector = self.fetch_from_provider(text).await?;

        if vector.len() != self.config.dimension {
            return Err(Error::new(
                ErrorCode::InvalidInput,
                format!(
                    "provider returned {}-dim vector, deployment fixes {}",
                    vector.len(),
                    self.config.dimension
                ),
            ));
        }

        // A semantically-equal neighbor already in cache wins: alias this
        // key to the neighbor's vector so near-duplicates share storage.
        if let Some((neighbor_key, similarity)) = self.cache.embedding_semantic.nearest(&vector) {
            if let Some(cached) = self.cache.embedding.get(&neighbor_key) {
                debug!(similarity, "embedding served via semantic alias");
                self.metrics
                    .cache_hits
                    .with_label_values(&["embedding_semantic"])
                    .inc();
                self.cache.embedding.put(key.to_string(), cached.clone());
                return Ok(cached);
            }
        }

        self.cache.embedding.put(key.to_string(), vector.clone());
        self.cache
            .embedding_semantic
            .insert(key.to_string(), vector.clone());
        Ok(vector)
    }

    async fn fetch_from_provider(&self, text: &str) -> Result<Vec<f32>> {
        let mut request = self.client.post(&self.config.endpoint).json(&serde_json::json!({
            "model": self.config.model,
            "prompt": text,
        }));
        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(provider_error)?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(Error::new(
                if status.as_u16() >= 500 || status.as_u16() == 429 {
                    ErrorCode::EmbeddingProviderError
                } else {
                    ErrorCode::InvalidInput
                },
                format!("embedding provider returned {}", status),
            ));
        }

        let body: EmbeddingResponse = response.json().await.map_err(provider_error)?;
        Ok(body.embedding)
    }
}

fn provider_error(err: reqwest::Error) -> Error {
    Error::new(ErrorCode::EmbeddingProviderError, err.to_string())
        .add_trace("embedding provider call")
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::config::CacheConfig;
    use sentinel_core::metrics::MetricsRegistry;

    fn client() -> EmbeddingClient {
        let cache = Arc::new(CacheService::new(&CacheConfig::default()));
        let registry = MetricsRegistry::new(sentinel_core::config::MetricsConfig {
            enabled: false,
            namespace: "test".into(),
        });
        EmbeddingClient::new(
            EmbeddingConfig {
                endpoint: "http://localhost:9/api/embeddings".into(),
                model: "test".into(),
                dimension: 4,
                request_timeout_secs: 1,
                api_key: None,
            },
            cache,
            PipelineMetrics::new(&registry),
        )
    }

    #[tokio::test]
    async fn empty_text_is_invalid_input() {
        let client = client();
        let err = client.embed("   ").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);
    }

    #[tokio::test]
    async fn cached_vector_avoids_provider() {
        let client = client();
        let text = "security|4625|failed logon|win-1|admin|203.0.113.45|lsass.exe";
        let key = sentinel_core::types::text_hash(text);
        client.cache.embedding.put(key, vec![0.1, 0.2, 0.3, 0.4]);

        // Endpoint is unroutable: success proves the cache served it.
        let vector = client.embed(text).await.unwrap();
        assert_eq!(vector.len(), 4);
    }

    #[tokio::test]
    async fn provider_unreachable_is_transient_provider_error() {
        let client = client();
        let err = client.embed("some canonical text").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::EmbeddingProviderError);
        assert!(err.is_transient());
    }
}
