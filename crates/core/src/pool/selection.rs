use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::instance::Instance;
use crate::config::BalanceAlgorithm;

/// Instance selection over the currently selectable set.
///
/// Selection is lock-free: round-robin cursors are atomics and weighted
/// choices walk a cumulative weight table built per call from live counters.
pub struct Selector {
    cursor: AtomicUsize,
    weighted_cursor: AtomicUsize,
}

impl Selector {
    pub fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
            weighted_cursor: AtomicUsize::new(0),
        }
    }

    /// Pick an instance among those that are healthy with a willing circuit.
    pub fn select(
        &self,
        instances: &[Arc<Instance>],
        algorithm: BalanceAlgorithm,
    ) -> Option<Arc<Instance>> {
        let selectable: Vec<&Arc<Instance>> =
            instances.iter().filter(|i| i.is_selectable()).collect();
        if selectable.is_empty() {
            return None;
        }

        let chosen = match algorithm {
            BalanceAlgorithm::RoundRobin => {
                let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % selectable.len();
                selectable[idx]
            }
            BalanceAlgorithm::WeightedRoundRobin => {
                self.weighted_pick(&selectable, |i| i.configured_weight as f64)
            }
            BalanceAlgorithm::WeightedByHealth => {
                self.weighted_pick(&selectable, |i| i.dynamic_weight())
            }
        };

        Some(Arc::clone(chosen))
    }

    fn weighted_pick<'a, F>(
        &self,
        selectable: &[&'a Arc<Instance>],
        weight_of: F,
    ) -> &'a Arc<Instance>
    where
        F: Fn(&Instance) -> f64,
    {
        let weights: Vec<f64> = selectable.iter().map(|i| weight_of(i).max(0.01)).collect();
        let total: f64 = weights.iter().sum();

        // Deterministic walk: advance a shared cursor through the cumulative
        // weight space so the long-run distribution matches the weights.
        let step = self.weighted_cursor.fetch_add(1, Ordering::Relaxed);
        let scaled_total = (total * 100.0) as usize;
        let point = if scaled_total == 0 {
            0.0
        } else {
            (step * 97 % scaled_total) as f64 / 100.0
        };

        let mut cumulative = 0.0;
        for (idx, weight) in weights.iter().enumerate() {
            cumulative += weight;
            if point < cumulative {
                return selectable[idx];
            }
        }
        selectable[selectable.len() - 1]
    }
}

impl Default for Selector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstanceConfig;
    use std::collections::HashMap;
    use std::time::Duration;

    fn instance(port: u16, weight: u32) -> Arc<Instance> {
        Arc::new(Instance::new(
            &InstanceConfig {
                host: "localhost".into(),
                port,
                weight,
                use_https: false,
            },
            3,
            Duration::from_secs(30),
        ))
    }

    #[test]
    fn round_robin_cycles_all_instances() {
        let selector = Selector::new();
        let instances = vec![instance(1, 100), instance(2, 100), instance(3, 100)];

        let mut seen = HashMap::new();
        for _ in 0..9 {
            let chosen = selector
                .select(&instances, BalanceAlgorithm::RoundRobin)
                .unwrap();
            *seen.entry(chosen.port).or_insert(0u32) += 1;
        }
        assert_eq!(seen.len(), 3);
        assert!(seen.values().all(|&count| count == 3));
    }

    #[test]
    fn weighted_round_robin_favors_heavier_instance() {
        let selector = Selector::new();
        let instances = vec![instance(1, 300), instance(2, 100)];

        let mut counts = HashMap::new();
        for _ in 0..400 {
            let chosen = selector
                .select(&instances, BalanceAlgorithm::WeightedRoundRobin)
                .unwrap();
            *counts.entry(chosen.port).or_insert(0u32) += 1;
        }
        assert!(counts[&1] > counts[&2] * 2);
    }

    #[test]
    fn unhealthy_instances_are_skipped() {
        let selector = Selector::new();
        let instances = vec![instance(1, 100), instance(2, 100)];
        instances[0].mark_healthy(false);

        for _ in 0..10 {
            let chosen = selector
                .select(&instances, BalanceAlgorithm::WeightedRoundRobin)
                .unwrap();
            assert_eq!(chosen.port, 2);
        }
    }

    #[test]
    fn empty_selectable_set_yields_none() {
        let selector = Selector::new();
        let instances = vec![instance(1, 100)];
        instances[0].mark_healthy(false);
        assert!(selector
            .select(&instances, BalanceAlgorithm::RoundRobin)
            .is_none());
    }

    #[test]
    fn open_circuit_excludes_instance() {
        let selector = Selector::new();
        let blocked = instance(1, 100);
        for _ in 0..3 {
            blocked.record_failure();
        }
        let instances = vec![Arc::clone(&blocked), instance(2, 100)];

        // Breaker cool-off has not elapsed: only instance 2 is selectable
        let chosen = selector
            .select(&instances, BalanceAlgorithm::RoundRobin)
            .unwrap();
        assert_eq!(chosen.port, 2);
    }
}
