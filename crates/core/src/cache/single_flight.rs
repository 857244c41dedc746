use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::Result;

/// Per-key in-flight guard preventing computation stampedes.
///
/// The first caller for a key computes while holding the key's lock; callers
/// arriving meanwhile block on the same lock and re-probe the cache once it
/// is released, so one provider call serves every concurrent request for an
/// equal key.
#[derive(Default)]
pub struct SingleFlight {
    inflight: DashMap<String, Arc<Mutex<()>>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `compute` at most once per key among concurrent callers.
    ///
    /// `probe` is consulted before and after lock acquisition; a hit skips
    /// the computation entirely.
    pub async fn run<V, P, C, Fut>(&self, key: &str, probe: P, compute: C) -> Result<V>
    where
        P: Fn() -> Option<V>,
        C: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if let Some(value) = probe() {
            return Ok(value);
        }

        let guard = self
            .inflight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _lock = guard.lock().await;

        // A winner may have populated the cache while we waited.
        if let Some(value) = probe() {
            self.cleanup(key, &guard);
            return Ok(value);
        }

        let result = compute().await;
        self.cleanup(key, &guard);
        result
    }

    fn cleanup(&self, key: &str, guard: &Arc<Mutex<()>>) {
        // Only the map and our clone hold the Arc once all waiters drained.
        if Arc::strong_count(guard) <= 2 {
            self.inflight.remove_if(key, |_, v| Arc::strong_count(v) <= 2);
        }
    }

    pub fn inflight_keys(&self) -> usize {
        self.inflight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::RwLock;

    #[tokio::test]
    async fn concurrent_callers_share_one_computation() {
        let flight = Arc::new(SingleFlight::new());
        let cache: Arc<RwLock<Option<u32>>> = Arc::new(RwLock::new(None));
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flight = Arc::clone(&flight);
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                flight
                    .run(
                        "key",
                        || cache.try_read().ok().and_then(|c| *c),
                        || async {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                            *cache.write().await = Some(7);
                            Ok(7u32)
                        },
                    )
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_contend() {
        let flight = SingleFlight::new();
        let a = flight.run("a", || None::<u32>, || async { Ok(1u32) }).await.unwrap();
        let b = flight.run("b", || None::<u32>, || async { Ok(2u32) }).await.unwrap();
        assert_eq!((a, b), (1, 2));
        assert_eq!(flight.inflight_keys(), 0);
    }
}
