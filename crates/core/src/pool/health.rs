use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::instance::Instance;
use crate::config::HealthConfig;

/// Active health prober for a set of pooled instances.
///
/// Every `check_interval` each instance receives an HTTP GET against its
/// health path. `consecutive_failure_threshold` failed probes mark an
/// instance Unhealthy; `consecutive_success_threshold` successful probes
/// return it to rotation. Transitions are serialized per instance because a
/// single monitor task owns all probing.
pub struct HealthMonitor {
    instances: Vec<Arc<Instance>>,
    config: HealthConfig,
    client: reqwest::Client,
    probe_path: String,
}

impl HealthMonitor {
    pub fn new(instances: Vec<Arc<Instance>>, config: HealthConfig, probe_path: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.check_timeout_secs))
            .build()
            .unwrap_or_default();

        Self {
            instances,
            config,
            client,
            probe_path: probe_path.into(),
        }
    }

    /// Run the probe loop until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.check_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("health monitor stopping");
                    break;
                }
                _ = interval.tick() => {
                    self.probe_all().await;
                }
            }
        }
    }

    async fn probe_all(&self) {
        for instance in &self.instances {
            let url = format!("{}{}", instance.base_url(), self.probe_path);
            let healthy_probe = match self.client.get(&url).send().await {
                Ok(response) => response.status().is_success(),
                Err(err) => {
                    debug!(instance = %instance.key(), error = %err, "health probe failed");
                    false
                }
            };

            self.apply_probe_result(instance, healthy_probe);
        }
    }

    fn apply_probe_result(&self, instance: &Arc<Instance>, probe_ok: bool) {
        if probe_ok {
            let successes = {
                // Probe successes count toward recovery only; they carry no
                // latency sample.
                instance.breaker.record_success();
                instance.note_probe_success()
            };
            if !instance.is_healthy() && successes >= self.config.consecutive_success_threshold {
                instance.mark_healthy(true);
            }
        } else {
            let failures = instance.note_probe_failure();
            if instance.is_healthy() && failures >= self.config.consecutive_failure_threshold {
                warn!(
                    instance = %instance.key(),
                    failures,
                    "marking instance unhealthy after failed probes"
                );
                instance.mark_healthy(false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstanceConfig;

    fn monitor_with(instance: Arc<Instance>) -> HealthMonitor {
        HealthMonitor::new(
            vec![instance],
            HealthConfig {
                check_interval_secs: 30,
                check_timeout_secs: 5,
                consecutive_failure_threshold: 3,
                consecutive_success_threshold: 2,
                enable_auto_recovery: true,
                recovery_interval_secs: 60,
            },
            "/healthz",
        )
    }

    fn instance() -> Arc<Instance> {
        Arc::new(Instance::new(
            &InstanceConfig {
                host: "localhost".into(),
                port: 6333,
                weight: 100,
                use_https: false,
            },
            3,
            Duration::from_secs(30),
        ))
    }

    #[test]
    fn three_failed_probes_mark_unhealthy() {
        let inst = instance();
        let monitor = monitor_with(Arc::clone(&inst));

        monitor.apply_probe_result(&inst, false);
        monitor.apply_probe_result(&inst, false);
        assert!(inst.is_healthy());
        monitor.apply_probe_result(&inst, false);
        assert!(!inst.is_healthy());
    }

    #[test]
    fn two_successful_probes_restore_rotation() {
        let inst = instance();
        let monitor = monitor_with(Arc::clone(&inst));

        for _ in 0..3 {
            monitor.apply_probe_result(&inst, false);
        }
        assert!(!inst.is_healthy());

        monitor.apply_probe_result(&inst, true);
        assert!(!inst.is_healthy());
        monitor.apply_probe_result(&inst, true);
        assert!(inst.is_healthy());
    }
}
