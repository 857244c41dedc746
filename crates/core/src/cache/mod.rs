//! # Multi-Keyspace Cache Layer
//!
//! In-process LRU+TTL cache shared by the enrichment stages. Four keyspaces
//! are maintained (`embedding`, `llm_response`, `ip_enrichment` and
//! `vector_search`), each with its own entry bound and TTL policy, under one
//! global memory budget.
//!
//! - Reads are non-blocking; entries are served only while inside their TTL.
//! - Strict LRU applies within a keyspace when its entry bound is reached;
//!   global memory pressure evicts the least-recently-used entry across all
//!   keyspaces until usage drops below the low watermark (80% of the bound).
//! - `put` paths run behind [`SingleFlight`] so equal keys never stampede a
//!   provider.
//! - The embedding and vector-search keyspaces additionally keep a
//!   [`SemanticIndex`] so a near-duplicate query (cosine at or above the
//!   configured threshold) can reuse an existing entry.

pub mod entry;
pub mod keyspace;
pub mod semantic;
pub mod single_flight;

pub use entry::{CacheEntry, CacheWeight};
pub use keyspace::{Keyspace, KeyspaceStats};
pub use semantic::{cosine_similarity, SemanticIndex};
pub use single_flight::SingleFlight;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::CacheConfig;
use crate::types::{IpEnrichment, SearchHit};

/// Aggregated cache statistics for the stats endpoint and metrics export.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size_bytes: usize,
    pub entries_per_keyspace: HashMap<String, usize>,
}

/// The shared cache service. Cheap to clone via `Arc` in `AppState`.
pub struct CacheService {
    pub embedding: Keyspace<Vec<f32>>,
    pub llm_response: Keyspace<serde_json::Value>,
    pub ip_enrichment: Keyspace<IpEnrichment>,
    pub vector_search: Keyspace<Vec<SearchHit>>,
    pub embedding_semantic: SemanticIndex,
    pub search_semantic: SemanticIndex,
    pub single_flight: SingleFlight,
    max_bytes: usize,
    global_bytes: Arc<AtomicUsize>,
}

impl CacheService {
    pub fn new(config: &CacheConfig) -> Self {
        let clock = Arc::new(AtomicU64::new(0));
        let global_bytes = Arc::new(AtomicUsize::new(0));
        let default_ttl = Duration::from_secs(config.default_ttl_min * 60);
        let embedding_ttl = Duration::from_secs(config.embedding_ttl_min * 60);
        let ip_ttl = Duration::from_secs(config.ip_ttl_min * 60);

        Self {
            embedding: Keyspace::new(
                "embedding",
                config.per_keyspace_max_entries,
                embedding_ttl,
                true,
                Arc::clone(&clock),
                Arc::clone(&global_bytes),
            ),
            llm_response: Keyspace::new(
                "llm_response",
                config.per_keyspace_max_entries,
                default_ttl,
                false,
                Arc::clone(&clock),
                Arc::clone(&global_bytes),
            ),
            ip_enrichment: Keyspace::new(
                "ip_enrichment",
                config.per_keyspace_max_entries,
                ip_ttl,
                false,
                Arc::clone(&clock),
                Arc::clone(&global_bytes),
            ),
            vector_search: Keyspace::new(
                "vector_search",
                config.per_keyspace_max_entries,
                default_ttl,
                false,
                Arc::clone(&clock),
                Arc::clone(&global_bytes),
            ),
            embedding_semantic: SemanticIndex::new(
                config.similarity_threshold,
                config.per_keyspace_max_entries.min(4_096),
            ),
            search_semantic: SemanticIndex::new(
                config.similarity_threshold,
                config.per_keyspace_max_entries.min(4_096),
            ),
            single_flight: SingleFlight::new(),
            max_bytes: (config.max_memory_mb as usize) * 1024 * 1024,
            global_bytes,
        }
    }

    pub fn total_bytes(&self) -> usize {
        self.global_bytes.load(Ordering::Relaxed)
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Enforce the global memory bound: evict the globally least-recently-
    /// used entry until usage is below the low watermark (80% of the bound).
    /// Returns the number of evicted entries.
    pub fn enforce_global_bound(&self) -> usize {
        self.evict_to_bytes(self.max_bytes * 4 / 5)
    }

    /// Evict globally-LRU entries until total usage is at or below `target`.
    pub fn evict_to_bytes(&self, target: usize) -> usize {
        let mut evicted = 0;
        while self.total_bytes() > target {
            if !self.evict_global_lru_once() {
                break;
            }
            evicted += 1;
        }
        if evicted > 0 {
            tracing::debug!(evicted, total_bytes = self.total_bytes(), "cache eviction pass");
        }
        evicted
    }

    fn evict_global_lru_once(&self) -> bool {
        // Pick the keyspace holding the globally least-recently-used entry.
        let candidates = [
            (0usize, self.embedding.oldest_access()),
            (1, self.llm_response.oldest_access()),
            (2, self.ip_enrichment.oldest_access()),
            (3, self.vector_search.oldest_access()),
        ];
        let victim = candidates
            .iter()
            .filter_map(|(idx, tick)| tick.map(|t| (*idx, t)))
            .min_by_key(|(_, tick)| *tick)
            .map(|(idx, _)| idx);

        match victim {
            Some(0) => self.embedding.evict_lru_one(),
            Some(1) => self.llm_response.evict_lru_one(),
            Some(2) => self.ip_enrichment.evict_lru_one(),
            Some(3) => self.vector_search.evict_lru_one(),
            _ => false,
        }
    }

    /// Drop expired entries in every keyspace; called by the periodic sweep.
    pub fn purge_expired(&self) -> usize {
        self.embedding.purge_expired()
            + self.llm_response.purge_expired()
            + self.ip_enrichment.purge_expired()
            + self.vector_search.purge_expired()
    }

    /// Clear one keyspace by name, or everything when `None`.
    pub fn clear(&self, keyspace: Option<&str>) {
        match keyspace {
            Some("embedding") => {
                self.embedding.clear();
                self.embedding_semantic.clear();
            }
            Some("llm_response") => self.llm_response.clear(),
            Some("ip_enrichment") => self.ip_enrichment.clear(),
            Some("vector_search") => {
                self.vector_search.clear();
                self.search_semantic.clear();
            }
            Some(_) => {}
            None => {
                self.embedding.clear();
                self.llm_response.clear();
                self.ip_enrichment.clear();
                self.vector_search.clear();
                self.embedding_semantic.clear();
                self.search_semantic.clear();
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let keyspaces: [(&str, u64, u64, u64, usize); 4] = [
            (
                self.embedding.name(),
                self.embedding.stats.hits.load(Ordering::Relaxed),
                self.embedding.stats.misses.load(Ordering::Relaxed),
                self.embedding.stats.evictions.load(Ordering::Relaxed),
                self.embedding.len(),
            ),
            (
                self.llm_response.name(),
                self.llm_response.stats.hits.load(Ordering::Relaxed),
                self.llm_response.stats.misses.load(Ordering::Relaxed),
                self.llm_response.stats.evictions.load(Ordering::Relaxed),
                self.llm_response.len(),
            ),
            (
                self.ip_enrichment.name(),
                self.ip_enrichment.stats.hits.load(Ordering::Relaxed),
                self.ip_enrichment.stats.misses.load(Ordering::Relaxed),
                self.ip_enrichment.stats.evictions.load(Ordering::Relaxed),
                self.ip_enrichment.len(),
            ),
            (
                self.vector_search.name(),
                self.vector_search.stats.hits.load(Ordering::Relaxed),
                self.vector_search.stats.misses.load(Ordering::Relaxed),
                self.vector_search.stats.evictions.load(Ordering::Relaxed),
                self.vector_search.len(),
            ),
        ];

        let mut entries_per_keyspace = HashMap::new();
        let mut hits = 0;
        let mut misses = 0;
        let mut evictions = 0;
        for (name, h, m, e, len) in keyspaces {
            entries_per_keyspace.insert(name.to_string(), len);
            hits += h;
            misses += m;
            evictions += e;
        }

        CacheStats {
            hits,
            misses,
            evictions,
            size_bytes: self.total_bytes(),
            entries_per_keyspace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> CacheService {
        CacheService::new(&CacheConfig {
            max_memory_mb: 1,
            default_ttl_min: 30,
            similarity_threshold: 0.95,
            per_keyspace_max_entries: 100,
            embedding_ttl_min: 60,
            ip_ttl_min: 240,
        })
    }

    #[test]
    fn stats_track_hits_and_misses() {
        let cache = service();
        cache.embedding.put("k", vec![1.0, 2.0]);
        assert!(cache.embedding.get("k").is_some());
        assert!(cache.embedding.get("missing").is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries_per_keyspace["embedding"], 1);
    }

    #[test]
    fn global_bound_evicts_across_keyspaces() {
        let cache = service();
        // ~16 KiB per vector; a 1 MiB bound forces eviction well before 200.
        for i in 0..200 {
            cache.embedding.put(format!("e{}", i), vec![0.5f32; 4096]);
        }
        for i in 0..50 {
            cache
                .llm_response
                .put(format!("l{}", i), serde_json::json!({"i": i}));
        }

        let evicted = cache.enforce_global_bound();
        assert!(evicted > 0);
        assert!(cache.total_bytes() <= cache.max_bytes() * 4 / 5);
    }

    #[test]
    fn clear_single_keyspace_leaves_others() {
        let cache = service();
        cache.embedding.put("e", vec![1.0]);
        cache.ip_enrichment.put("1.2.3.4", IpEnrichment::unknown());

        cache.clear(Some("embedding"));
        assert_eq!(cache.embedding.len(), 0);
        assert_eq!(cache.ip_enrichment.len(), 1);
    }
}
