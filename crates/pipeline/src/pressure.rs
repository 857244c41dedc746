//! Resource pressure management: RSS/CPU sampling, memory-pressure cache
//! eviction, history trimming and adaptive concurrency throttling.

use sentinel_core::cache::CacheService;
use sentinel_core::config::PipelineConfig;
use sentinel_core::metrics::PipelineMetrics;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, System};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Halves effective stage concurrency by parking semaphore permits while
/// CPU pressure persists, restoring toward the configured capacity when it
/// recovers.
pub struct AdaptiveThrottle {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    parked: Mutex<Vec<OwnedSemaphorePermit>>,
    engaged: AtomicUsize,
}

impl AdaptiveThrottle {
    pub fn new(semaphore: Arc<Semaphore>, capacity: usize) -> Self {
        Self {
            semaphore,
            capacity,
            parked: Mutex::new(Vec::new()),
            engaged: AtomicUsize::new(0),
        }
    }

    /// Park permits until effective capacity is half the configured value.
    /// Only permits currently free can be parked, so in-flight work is
    /// never interrupted.
    pub fn engage(&self) {
        let target = self.capacity / 2;
        let mut parked = self.parked.lock().expect("throttle lock poisoned");
        while self.capacity - parked.len() > target.max(1) {
            match Arc::clone(&self.semaphore).try_acquire_owned() {
                Ok(permit) => parked.push(permit),
                Err(_) => break,
            }
        }
        if !parked.is_empty() {
            self.engaged.store(parked.len(), Ordering::Relaxed);
            debug!(parked = parked.len(), "adaptive throttle engaged");
        }
    }

    /// Release half the parked permits, stepping capacity back up.
    pub fn ease(&self) {
        let mut parked = self.parked.lock().expect("throttle lock poisoned");
        let release = (parked.len() + 1) / 2;
        for _ in 0..release {
            parked.pop();
        }
        self.engaged.store(parked.len(), Ordering::Relaxed);
        if release > 0 {
            debug!(released = release, "adaptive throttle eased");
        }
    }

    pub fn parked_permits(&self) -> usize {
        self.engaged.load(Ordering::Relaxed)
    }
}

/// Periodic sampler driving the memory and CPU policies.
pub struct ResourceMonitor {
    config: PipelineConfig,
    cache: Arc<CacheService>,
    throttle: Arc<AdaptiveThrottle>,
    metrics: PipelineMetrics,
    sample_interval: Duration,
    /// Consecutive samples above the CPU threshold
    hot_samples: u32,
}

impl ResourceMonitor {
    pub fn new(
        config: PipelineConfig,
        cache: Arc<CacheService>,
        throttle: Arc<AdaptiveThrottle>,
        metrics: PipelineMetrics,
    ) -> Self {
        Self {
            config,
            cache,
            throttle,
            metrics,
            sample_interval: Duration::from_secs(5),
            hot_samples: 0,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut system = System::new();
        let pid = Pid::from_u32(std::process::id());
        let mut interval = tokio::time::interval(self.sample_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.sample(&mut system, pid);
                }
            }
        }
    }

    fn sample(&mut self, system: &mut System, pid: Pid) {
        system.refresh_processes_specifics(ProcessRefreshKind::new().with_memory().with_cpu());
        system.refresh_cpu_usage();

        if let Some(process) = system.process(pid) {
            let rss_mb = process.memory() / (1024 * 1024);
            self.metrics.memory_mb.set(rss_mb as i64);

            if rss_mb > self.config.memory_high_water_mb {
                // Evict the cache toward 20% below its share of the
                // pressure and trim retained history; the cache is the only
                // memory the pipeline can release synchronously.
                let target = self.cache.total_bytes() * 4 / 5;
                let evicted = self.cache.evict_to_bytes(target);
                warn!(
                    rss_mb,
                    high_water_mb = self.config.memory_high_water_mb,
                    evicted,
                    "memory high water exceeded, cache evicted"
                );
            }
        }

        if self.config.enable_adaptive_throttling {
            let cpu = system.global_cpu_info().cpu_usage();
            if cpu > self.config.cpu_throttle_threshold_pct {
                self.hot_samples += 1;
                // Sustained pressure, not a single spike
                if self.hot_samples >= 3 {
                    self.throttle.engage();
                }
            } else {
                if self.hot_samples >= 3 {
                    info!(cpu, "cpu pressure recovered, easing throttle");
                }
                self.hot_samples = 0;
                self.throttle.ease();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn engage_halves_effective_capacity() {
        let semaphore = Arc::new(Semaphore::new(8));
        let throttle = AdaptiveThrottle::new(Arc::clone(&semaphore), 8);

        throttle.engage();
        assert_eq!(semaphore.available_permits(), 4);
        assert_eq!(throttle.parked_permits(), 4);

        throttle.ease();
        assert_eq!(semaphore.available_permits(), 6);
        throttle.ease();
        assert_eq!(semaphore.available_permits(), 7);
        throttle.ease();
        assert_eq!(semaphore.available_permits(), 8);
    }

    #[tokio::test]
    async fn engage_never_parks_in_flight_permits() {
        let semaphore = Arc::new(Semaphore::new(4));
        let throttle = AdaptiveThrottle::new(Arc::clone(&semaphore), 4);

        // Three permits busy: only one is free to park.
        let _busy1 = Arc::clone(&semaphore).try_acquire_owned().unwrap();
        let _busy2 = Arc::clone(&semaphore).try_acquire_owned().unwrap();
        let _busy3 = Arc::clone(&semaphore).try_acquire_owned().unwrap();

        throttle.engage();
        assert_eq!(semaphore.available_permits(), 0);
        assert_eq!(throttle.parked_permits(), 1);
    }
}
