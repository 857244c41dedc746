//! # Upstream Instance Pool
//!
//! Generic pool over the configured upstream instances (the vector store,
//! and optionally HTTP back ends for other providers). Responsibilities:
//!
//! - **Selection**: round-robin, weighted round-robin (default) or
//!   health-weighted dynamic balancing over the currently selectable set.
//! - **Health**: active probing with consecutive-failure/-success
//!   thresholds; request failures also count toward the unhealthy
//!   transition.
//! - **Circuit breaking**: per-instance Closed → Open → HalfOpen; an Open
//!   instance is never selected unless its half-open probe slot is free.
//! - **Degradation**: when fewer than `min_healthy_instances` remain the
//!   pool reports Degraded and acquisition fails fast with
//!   `NoHealthyInstance`.

pub mod breaker;
pub mod health;
pub mod instance;
pub mod selection;

pub use breaker::{BreakerState, CircuitBreaker};
pub use health::HealthMonitor;
pub use instance::{Instance, InstanceSnapshot};
pub use selection::Selector;

use std::sync::Arc;
use std::time::Duration;

use crate::config::{BalanceAlgorithm, HealthConfig, PoolConfig};
use crate::error::{Error, ErrorCode, Result};
use crate::types::ComponentHealth;

/// An acquired instance lease. Holds the in-flight slot until dropped;
/// callers report the request outcome through it.
#[derive(Debug)]
pub struct InstanceLease {
    instance: Arc<Instance>,
    unhealthy_threshold: u32,
    reported: bool,
}

impl InstanceLease {
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn base_url(&self) -> String {
        self.instance.base_url()
    }

    pub fn report_success(mut self, latency: Duration) {
        self.instance.record_success(latency);
        self.reported = true;
    }

    pub fn report_failure(mut self) {
        let failures = self.instance.record_failure();
        if failures >= self.unhealthy_threshold {
            self.instance.mark_healthy(false);
        }
        self.reported = true;
    }
}

impl Drop for InstanceLease {
    fn drop(&mut self) {
        self.instance.end_request();
        if !self.reported {
            // A dropped lease without an outcome means the caller bailed;
            // treat as failure so the breaker sees it.
            self.instance.record_failure();
        }
    }
}

/// Pool over the configured upstream instances.
pub struct InstancePool {
    instances: Vec<Arc<Instance>>,
    selector: Selector,
    algorithm: BalanceAlgorithm,
    min_healthy: usize,
    unhealthy_threshold: u32,
    enable_failover: bool,
}

impl InstancePool {
    pub fn new(pool_config: &PoolConfig, health_config: &HealthConfig) -> Self {
        let cool_off = Duration::from_secs(health_config.recovery_interval_secs);
        let instances: Vec<Arc<Instance>> = pool_config
            .instances
            .iter()
            .map(|cfg| {
                Arc::new(Instance::new(
                    cfg,
                    health_config.consecutive_failure_threshold,
                    cool_off,
                ))
            })
            .collect();

        Self {
            instances,
            selector: Selector::new(),
            algorithm: pool_config.algorithm,
            min_healthy: pool_config.min_healthy_instances,
            unhealthy_threshold: health_config.consecutive_failure_threshold,
            enable_failover: pool_config.enable_failover,
        }
    }

    pub fn instances(&self) -> &[Arc<Instance>] {
        &self.instances
    }

    /// Lease an instance for one request.
    ///
    /// Selection skips unhealthy instances and those with unwilling
    /// circuits. A selected instance must also win its breaker admission
    /// (half-open probes admit exactly one request); on a lost race another
    /// instance is tried when failover is enabled.
    pub fn acquire(&self) -> Result<InstanceLease> {
        let attempts = if self.enable_failover {
            self.instances.len().max(1)
        } else {
            1
        };

        for _ in 0..attempts {
            let Some(instance) = self.selector.select(&self.instances, self.algorithm) else {
                break;
            };
            if !instance.breaker.try_acquire() {
                continue;
            }
            instance.begin_request();
            return Ok(InstanceLease {
                instance,
                unhealthy_threshold: self.unhealthy_threshold,
                reported: false,
            });
        }

        Err(Error::new(
            ErrorCode::NoHealthyInstance,
            "no selectable upstream instance available",
        ))
    }

    pub fn healthy_count(&self) -> usize {
        self.instances.iter().filter(|i| i.is_healthy()).count()
    }

    /// Below the `min_healthy_instances` floor the pool is Degraded.
    pub fn health(&self) -> ComponentHealth {
        let healthy = self.healthy_count();
        if healthy == 0 {
            ComponentHealth::Unhealthy
        } else if healthy < self.min_healthy {
            ComponentHealth::Degraded
        } else {
            ComponentHealth::Healthy
        }
    }

    pub fn snapshots(&self) -> Vec<InstanceSnapshot> {
        self.instances.iter().map(|i| i.snapshot()).collect()
    }

    /// Spawn the active health monitor for this pool's instances.
    pub fn spawn_health_monitor(
        &self,
        config: HealthConfig,
        probe_path: &str,
        cancel: tokio_util::sync::CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let monitor = HealthMonitor::new(self.instances.clone(), config, probe_path);
        tokio::spawn(monitor.run(cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstanceConfig;

    fn pool(weights: &[u32]) -> InstancePool {
        let pool_config = PoolConfig {
            instances: weights
                .iter()
                .enumerate()
                .map(|(idx, weight)| InstanceConfig {
                    host: "localhost".into(),
                    port: 6333 + idx as u16,
                    weight: *weight,
                    use_https: false,
                })
                .collect(),
            ..PoolConfig::default()
        };
        InstancePool::new(&pool_config, &HealthConfig::default())
    }

    #[test]
    fn failover_routes_around_failed_instance() {
        let pool = pool(&[100, 80]);

        // Three failures mark instance A unhealthy
        for _ in 0..3 {
            let lease = pool.acquire().unwrap();
            if lease.instance().port == 6333 {
                lease.report_failure();
            } else {
                lease.report_success(Duration::from_millis(5));
            }
        }
        // Force remaining failures directly in case selection favored B
        while pool.instances()[0].is_healthy() {
            pool.instances()[0].record_failure();
            if pool.instances()[0].consecutive_failures() >= 3 {
                pool.instances()[0].mark_healthy(false);
            }
        }

        for _ in 0..10 {
            let lease = pool.acquire().unwrap();
            assert_eq!(lease.instance().port, 6334);
            lease.report_success(Duration::from_millis(5));
        }
    }

    #[test]
    fn degraded_below_min_healthy_floor() {
        let pool_config = PoolConfig {
            instances: vec![
                InstanceConfig {
                    host: "localhost".into(),
                    port: 6333,
                    weight: 100,
                    use_https: false,
                },
                InstanceConfig {
                    host: "localhost".into(),
                    port: 6334,
                    weight: 100,
                    use_https: false,
                },
            ],
            min_healthy_instances: 2,
            ..PoolConfig::default()
        };
        let pool = InstancePool::new(&pool_config, &HealthConfig::default());
        assert_eq!(pool.health(), ComponentHealth::Healthy);

        pool.instances()[0].mark_healthy(false);
        assert_eq!(pool.health(), ComponentHealth::Degraded);

        pool.instances()[1].mark_healthy(false);
        assert_eq!(pool.health(), ComponentHealth::Unhealthy);
    }

    #[test]
    fn acquire_fails_when_everything_is_down() {
        let pool = pool(&[100]);
        pool.instances()[0].mark_healthy(false);
        let err = pool.acquire().unwrap_err();
        assert_eq!(err.code, ErrorCode::NoHealthyInstance);
    }

    #[test]
    fn lease_drop_without_report_counts_as_failure() {
        let pool = pool(&[100]);
        {
            let _lease = pool.acquire().unwrap();
        }
        assert_eq!(pool.instances()[0].consecutive_failures(), 1);
        assert_eq!(pool.instances()[0].in_flight(), 0);
    }
}
