use std::time::{Duration, Instant};

/// A single cached value with its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub created: Instant,
    pub ttl: Duration,
    /// Logical access clock tick of the most recent read
    pub last_access: u64,
    pub size_bytes: usize,
}

impl<V> CacheEntry<V> {
    pub fn new(value: V, ttl: Duration, size_bytes: usize, access_tick: u64) -> Self {
        Self {
            value,
            created: Instant::now(),
            ttl,
            last_access: access_tick,
            size_bytes,
        }
    }

    /// Entries are only served while `now < created + ttl`.
    pub fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.created) >= self.ttl
    }

    /// Extend lifetime from now; used by keyspaces with extend-on-access TTL.
    pub fn touch_created(&mut self) {
        self.created = Instant::now();
    }
}

/// Approximate in-memory weight of a cached value, used for the global
/// memory bound. Estimates only need to be consistent, not exact.
pub trait CacheWeight {
    fn weight_bytes(&self) -> usize;
}

impl CacheWeight for String {
    fn weight_bytes(&self) -> usize {
        self.len() + std::mem::size_of::<String>()
    }
}

impl CacheWeight for Vec<f32> {
    fn weight_bytes(&self) -> usize {
        self.len() * std::mem::size_of::<f32>() + std::mem::size_of::<Vec<f32>>()
    }
}

impl CacheWeight for serde_json::Value {
    fn weight_bytes(&self) -> usize {
        match self {
            serde_json::Value::Null | serde_json::Value::Bool(_) => 16,
            serde_json::Value::Number(_) => 24,
            serde_json::Value::String(s) => s.len() + 32,
            serde_json::Value::Array(items) => {
                32 + items.iter().map(CacheWeight::weight_bytes).sum::<usize>()
            }
            serde_json::Value::Object(map) => {
                32 + map
                    .iter()
                    .map(|(k, v)| k.len() + 16 + v.weight_bytes())
                    .sum::<usize>()
            }
        }
    }
}

impl CacheWeight for crate::types::IpEnrichment {
    fn weight_bytes(&self) -> usize {
        let strings = self.country.as_deref().map_or(0, str::len)
            + self.city.as_deref().map_or(0, str::len)
            + self.organization.as_deref().map_or(0, str::len);
        strings + 64
    }
}

impl CacheWeight for Vec<crate::types::SearchHit> {
    fn weight_bytes(&self) -> usize {
        self.iter()
            .map(|hit| {
                64 + hit
                    .metadata
                    .iter()
                    .map(|(k, v)| k.len() + v.len() + 16)
                    .sum::<usize>()
            })
            .sum::<usize>()
            + std::mem::size_of::<Vec<crate::types::SearchHit>>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_is_ttl_bound() {
        let entry = CacheEntry::new("value".to_string(), Duration::from_millis(10), 5, 0);
        assert!(!entry.is_expired(Instant::now()));
        assert!(entry.is_expired(Instant::now() + Duration::from_millis(11)));
    }

    #[test]
    fn vector_weight_scales_with_dimension() {
        let small: Vec<f32> = vec![0.0; 128];
        let large: Vec<f32> = vec![0.0; 1024];
        assert!(large.weight_bytes() > small.weight_bytes());
    }
}
