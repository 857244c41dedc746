use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::entry::{CacheEntry, CacheWeight};

/// Counters exposed through `CacheService::stats`.
#[derive(Debug, Default)]
pub struct KeyspaceStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub expirations: AtomicU64,
}

/// One named cache partition with its own entry bound and TTL policy.
///
/// Reads are non-blocking (sharded `DashMap`); LRU ordering uses a logical
/// access clock stored per entry, so eviction picks the entry with the
/// smallest tick. Memory usage is reported into the shared byte counter the
/// owning `CacheService` uses for its global bound.
pub struct Keyspace<V> {
    name: &'static str,
    entries: DashMap<String, CacheEntry<V>>,
    max_entries: usize,
    default_ttl: Duration,
    /// Extend entry lifetime on read (embedding keyspace semantics)
    extend_on_access: bool,
    clock: Arc<AtomicU64>,
    bytes: AtomicUsize,
    global_bytes: Arc<AtomicUsize>,
    pub stats: KeyspaceStats,
}

impl<V: Clone + CacheWeight> Keyspace<V> {
    pub fn new(
        name: &'static str,
        max_entries: usize,
        default_ttl: Duration,
        extend_on_access: bool,
        clock: Arc<AtomicU64>,
        global_bytes: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            name,
            entries: DashMap::new(),
            max_entries,
            default_ttl,
            extend_on_access,
            clock,
            bytes: AtomicUsize::new(0),
            global_bytes,
            stats: KeyspaceStats::default(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let tick = self.clock.fetch_add(1, Ordering::Relaxed);

        if let Some(mut entry) = self.entries.get_mut(key) {
            if entry.is_expired(now) {
                drop(entry);
                self.remove(key);
                self.stats.expirations.fetch_add(1, Ordering::Relaxed);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            entry.last_access = tick;
            if self.extend_on_access {
                entry.touch_created();
            }
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry.value.clone());
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn put(&self, key: impl Into<String>, value: V) {
        self.put_with_ttl(key, value, self.default_ttl);
    }

    pub fn put_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        let size = value.weight_bytes() + key.len();
        let tick = self.clock.fetch_add(1, Ordering::Relaxed);
        let entry = CacheEntry::new(value, ttl, size, tick);

        if let Some(old) = self.entries.insert(key, entry) {
            self.bytes.fetch_sub(old.size_bytes, Ordering::Relaxed);
            self.global_bytes.fetch_sub(old.size_bytes, Ordering::Relaxed);
        }
        self.bytes.fetch_add(size, Ordering::Relaxed);
        self.global_bytes.fetch_add(size, Ordering::Relaxed);

        while self.entries.len() > self.max_entries {
            if !self.evict_lru_one() {
                break;
            }
        }
    }

    pub fn invalidate(&self, key: &str) {
        self.remove(key);
    }

    pub fn clear(&self) {
        let freed: usize = self.entries.iter().map(|e| e.size_bytes).sum();
        self.entries.clear();
        self.bytes.fetch_sub(freed, Ordering::Relaxed);
        self.global_bytes.fetch_sub(freed, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Tick of the least-recently-used live entry, for cross-keyspace
    /// eviction ordering.
    pub fn oldest_access(&self) -> Option<u64> {
        self.entries.iter().map(|e| e.last_access).min()
    }

    /// Evict the least-recently-used entry. Returns false when empty.
    pub fn evict_lru_one(&self) -> bool {
        let victim = self
            .entries
            .iter()
            .min_by_key(|e| e.last_access)
            .map(|e| e.key().clone());

        match victim {
            Some(key) => {
                self.remove(&key);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Drop entries past their TTL. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.is_expired(now))
            .map(|e| e.key().clone())
            .collect();
        let count = expired.len();
        for key in expired {
            self.remove(&key);
            self.stats.expirations.fetch_add(1, Ordering::Relaxed);
        }
        count
    }

    fn remove(&self, key: &str) {
        if let Some((_, entry)) = self.entries.remove(key) {
            self.bytes.fetch_sub(entry.size_bytes, Ordering::Relaxed);
            self.global_bytes.fetch_sub(entry.size_bytes, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyspace(max_entries: usize) -> Keyspace<String> {
        Keyspace::new(
            "test",
            max_entries,
            Duration::from_secs(60),
            false,
            Arc::new(AtomicU64::new(0)),
            Arc::new(AtomicUsize::new(0)),
        )
    }

    #[test]
    fn lru_eviction_removes_least_recent() {
        let ks = keyspace(2);
        ks.put("a", "1".to_string());
        ks.put("b", "2".to_string());
        // Touch "a" so "b" becomes the LRU victim
        assert!(ks.get("a").is_some());
        ks.put("c", "3".to_string());

        assert_eq!(ks.len(), 2);
        assert!(ks.get("a").is_some());
        assert!(ks.get("b").is_none());
        assert!(ks.get("c").is_some());
    }

    #[test]
    fn expired_entries_are_not_served() {
        let ks = keyspace(10);
        ks.put_with_ttl("k", "v".to_string(), Duration::from_millis(0));
        assert!(ks.get("k").is_none());
        assert_eq!(ks.stats.expirations.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn byte_accounting_tracks_inserts_and_removals() {
        let ks = keyspace(10);
        ks.put("k", "0123456789".to_string());
        assert!(ks.bytes() > 0);
        ks.invalidate("k");
        assert_eq!(ks.bytes(), 0);
    }

    #[test]
    fn replacing_a_key_does_not_leak_bytes() {
        let ks = keyspace(10);
        ks.put("k", "aaaaaaaaaa".to_string());
        let first = ks.bytes();
        ks.put("k", "bbbbbbbbbb".to_string());
        assert_eq!(ks.bytes(), first);
    }
}
