use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use super::breaker::{BreakerState, CircuitBreaker};
use crate::config::InstanceConfig;

/// EWMA smoothing factor for request latency.
const LATENCY_ALPHA: f64 = 0.2;
/// Latency considered "baseline" when computing dynamic weights.
const BASELINE_LATENCY_MS: f64 = 50.0;

/// A single pooled upstream instance with its live health state.
///
/// All counters are atomics so selection can run concurrently; health
/// transitions are serialized by the health monitor.
#[derive(Debug)]
pub struct Instance {
    pub host: String,
    pub port: u16,
    pub use_https: bool,
    pub configured_weight: u32,
    healthy: AtomicBool,
    in_flight: AtomicU32,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    /// f64 bits of the latency EWMA in milliseconds
    ewma_latency_bits: AtomicU64,
    requests: AtomicU64,
    errors: AtomicU64,
    pub breaker: CircuitBreaker,
}

impl Instance {
    pub fn new(config: &InstanceConfig, failure_threshold: u32, cool_off: Duration) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            use_https: config.use_https,
            configured_weight: config.weight.max(1),
            healthy: AtomicBool::new(true),
            in_flight: AtomicU32::new(0),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            ewma_latency_bits: AtomicU64::new(BASELINE_LATENCY_MS.to_bits()),
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            breaker: CircuitBreaker::new(failure_threshold, cool_off),
        }
    }

    pub fn base_url(&self) -> String {
        let scheme = if self.use_https { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Selectable means healthy and admitted by the circuit breaker. An Open
    /// circuit excludes the instance unless its half-open probe slot is free.
    pub fn is_selectable(&self) -> bool {
        self.is_healthy() && self.breaker.would_allow()
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn begin_request(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn end_request(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn ewma_latency_ms(&self) -> f64 {
        f64::from_bits(self.ewma_latency_bits.load(Ordering::Relaxed))
    }

    pub fn error_rate(&self) -> f64 {
        let requests = self.requests.load(Ordering::Relaxed);
        if requests == 0 {
            return 0.0;
        }
        self.errors.load(Ordering::Relaxed) as f64 / requests as f64
    }

    pub fn record_success(&self, latency: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.consecutive_successes.fetch_add(1, Ordering::Relaxed);
        self.breaker.record_success();
        self.update_ewma(latency.as_secs_f64() * 1_000.0);
    }

    /// Record a failed request. Returns the new consecutive-failure count so
    /// callers can apply their unhealthy threshold.
    pub fn record_failure(&self) -> u32 {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.consecutive_successes.store(0, Ordering::Relaxed);
        self.breaker.record_failure();
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Health-probe success; returns the new consecutive-success count.
    pub fn note_probe_success(&self) -> u32 {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Health-probe failure; returns the new consecutive-failure count.
    pub fn note_probe_failure(&self) -> u32 {
        self.consecutive_successes.store(0, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes.load(Ordering::Relaxed)
    }

    pub fn mark_healthy(&self, healthy: bool) {
        let was = self.healthy.swap(healthy, Ordering::Relaxed);
        if was != healthy {
            if healthy {
                tracing::info!(instance = %self.key(), "instance returned to rotation");
            } else {
                tracing::warn!(instance = %self.key(), "instance removed from rotation");
            }
            self.consecutive_failures.store(0, Ordering::Relaxed);
            self.consecutive_successes.store(0, Ordering::Relaxed);
        }
    }

    /// Dynamic weight for health-aware balancing:
    /// `configured × clamp(0.4·(baseline/ewma) + 0.3·(1−error_rate)
    /// + 0.3/(1+in_flight), 0.1, 3.0)`.
    pub fn dynamic_weight(&self) -> f64 {
        let latency_factor = BASELINE_LATENCY_MS / self.ewma_latency_ms().max(1.0);
        let error_factor = 1.0 - self.error_rate();
        let concurrency_factor = 1.0 / (1.0 + self.in_flight() as f64);
        let multiplier =
            (0.4 * latency_factor + 0.3 * error_factor + 0.3 * concurrency_factor).clamp(0.1, 3.0);
        self.configured_weight as f64 * multiplier
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            host: self.host.clone(),
            port: self.port,
            weight: self.configured_weight,
            use_https: self.use_https,
            healthy: self.is_healthy(),
            in_flight: self.in_flight(),
            consecutive_failures: self.consecutive_failures(),
            consecutive_successes: self.consecutive_successes(),
            ewma_latency_ms: self.ewma_latency_ms(),
            error_rate: self.error_rate(),
            circuit_state: self.breaker.state(),
        }
    }

    fn update_ewma(&self, sample_ms: f64) {
        // Benign race: a lost update only skews the smoothing slightly.
        let current = self.ewma_latency_ms();
        let next = current * (1.0 - LATENCY_ALPHA) + sample_ms * LATENCY_ALPHA;
        self.ewma_latency_bits.store(next.to_bits(), Ordering::Relaxed);
    }
}

/// Point-in-time view of an instance for the pool metrics endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct InstanceSnapshot {
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub use_https: bool,
    pub healthy: bool,
    pub in_flight: u32,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub ewma_latency_ms: f64,
    pub error_rate: f64,
    pub circuit_state: BreakerState,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(weight: u32) -> Instance {
        Instance::new(
            &InstanceConfig {
                host: "localhost".into(),
                port: 6333,
                weight,
                use_https: false,
            },
            3,
            Duration::from_secs(30),
        )
    }

    #[test]
    fn dynamic_weight_degrades_with_latency() {
        let fast = instance(100);
        let slow = instance(100);
        for _ in 0..20 {
            fast.record_success(Duration::from_millis(10));
            slow.record_success(Duration::from_millis(800));
        }
        assert!(fast.dynamic_weight() > slow.dynamic_weight());
    }

    #[test]
    fn dynamic_weight_stays_clamped() {
        let inst = instance(100);
        for _ in 0..50 {
            inst.record_failure();
        }
        assert!(inst.dynamic_weight() >= 100.0 * 0.1 - f64::EPSILON);
        assert!(inst.dynamic_weight() <= 100.0 * 3.0 + f64::EPSILON);
    }

    #[test]
    fn error_rate_tracks_failures() {
        let inst = instance(100);
        inst.record_success(Duration::from_millis(5));
        inst.record_failure();
        assert!((inst.error_rate() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn in_flight_counter_balances() {
        let inst = instance(100);
        inst.begin_request();
        inst.begin_request();
        assert_eq!(inst.in_flight(), 2);
        inst.end_request();
        assert_eq!(inst.in_flight(), 1);
    }
}
