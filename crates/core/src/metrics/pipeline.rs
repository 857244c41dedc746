use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts};

use super::registry::MetricsRegistry;

/// Prometheus instruments for the event pipeline.
///
/// Registered once at startup; every stage holds a clone. The orchestrator
/// additionally derives its REST-visible counter snapshot from these plus
/// its own atomics.
#[derive(Clone)]
pub struct PipelineMetrics {
    pub events_accepted: IntCounter,
    pub events_rejected: IntCounter,
    pub events_persisted: IntCounter,
    pub events_deduplicated: IntCounter,
    pub events_dead_lettered: IntCounter,
    pub skipped_on_throttle: IntCounter,
    pub semaphore_acquired: IntCounter,
    pub semaphore_timeouts: IntCounter,
    pub queue_depth: IntGauge,
    pub memory_mb: IntGauge,
    pub processing_latency_ms: Histogram,
    pub throttle_wait_ms: Histogram,
    pub stage_failures: IntCounterVec,
    pub cache_hits: IntCounterVec,
    pub cache_misses: IntCounterVec,
    pub correlations_detected: IntCounterVec,
    pub broadcasts_sent: IntCounterVec,
    pub llm_requests: IntCounterVec,
    pub llm_latency_ms: Histogram,
    pub llm_tokens: IntCounter,
    pub watcher_records: IntCounterVec,
    pub watcher_parse_errors: IntCounterVec,
    pub watcher_dropped: IntCounterVec,
}

impl PipelineMetrics {
    pub fn new(registry: &MetricsRegistry) -> Self {
        let metrics = Self {
            events_accepted: IntCounter::new("pipeline_events_accepted_total", "Records accepted into the intake queue").expect("metric"),
            events_rejected: IntCounter::new("pipeline_events_rejected_total", "Records rejected at intake").expect("metric"),
            events_persisted: IntCounter::new("pipeline_events_persisted_total", "Security events persisted").expect("metric"),
            events_deduplicated: IntCounter::new("pipeline_events_deduplicated_total", "Records suppressed by the dedup window").expect("metric"),
            events_dead_lettered: IntCounter::new("pipeline_events_dead_lettered_total", "Events diverted to the dead-letter queue").expect("metric"),
            skipped_on_throttle: IntCounter::new("pipeline_skipped_on_throttle_total", "Events persisted degraded after a throttle timeout").expect("metric"),
            semaphore_acquired: IntCounter::new("pipeline_semaphore_acquired_total", "Successful stage-semaphore acquisitions").expect("metric"),
            semaphore_timeouts: IntCounter::new("pipeline_semaphore_timeouts_total", "Stage-semaphore acquisition timeouts").expect("metric"),
            queue_depth: IntGauge::new("pipeline_queue_depth", "Current intake queue depth").expect("metric"),
            memory_mb: IntGauge::new("pipeline_memory_mb", "Resident set size in MiB").expect("metric"),
            processing_latency_ms: Histogram::with_opts(
                HistogramOpts::new("pipeline_processing_latency_ms", "End-to-end record processing latency")
                    .buckets(vec![5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0]),
            ).expect("metric"),
            throttle_wait_ms: Histogram::with_opts(
                HistogramOpts::new("pipeline_throttle_wait_ms", "Time spent waiting for the stage semaphore")
                    .buckets(vec![1.0, 5.0, 25.0, 100.0, 500.0, 2000.0, 10000.0]),
            ).expect("metric"),
            stage_failures: IntCounterVec::new(
                Opts::new("pipeline_stage_failures_total", "Stage failures by stage and disposition"),
                &["stage", "disposition"],
            ).expect("metric"),
            cache_hits: IntCounterVec::new(
                Opts::new("cache_hits_total", "Cache hits by keyspace"),
                &["keyspace"],
            ).expect("metric"),
            cache_misses: IntCounterVec::new(
                Opts::new("cache_misses_total", "Cache misses by keyspace"),
                &["keyspace"],
            ).expect("metric"),
            correlations_detected: IntCounterVec::new(
                Opts::new("correlations_detected_total", "Correlations emitted by type"),
                &["type"],
            ).expect("metric"),
            broadcasts_sent: IntCounterVec::new(
                Opts::new("hub_broadcasts_total", "Hub messages sent by kind"),
                &["kind"],
            ).expect("metric"),
            llm_requests: IntCounterVec::new(
                Opts::new("llm_requests_total", "LLM analyzer calls by model and outcome"),
                &["model", "outcome"],
            ).expect("metric"),
            llm_latency_ms: Histogram::with_opts(
                HistogramOpts::new("llm_latency_ms", "LLM analyzer request latency")
                    .buckets(vec![50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 15000.0, 30000.0]),
            ).expect("metric"),
            llm_tokens: IntCounter::new("llm_tokens_total", "Tokens consumed by LLM analysis").expect("metric"),
            watcher_records: IntCounterVec::new(
                Opts::new("watcher_records_total", "Raw records read by channel"),
                &["channel"],
            ).expect("metric"),
            watcher_parse_errors: IntCounterVec::new(
                Opts::new("watcher_parse_errors_total", "Unparseable records by channel"),
                &["channel"],
            ).expect("metric"),
            watcher_dropped: IntCounterVec::new(
                Opts::new("watcher_dropped_total", "Records dropped by overflow policy, by channel"),
                &["channel"],
            ).expect("metric"),
        };

        metrics.register_all(registry);
        metrics
    }

    fn register_all(&self, registry: &MetricsRegistry) {
        let _ = registry.register(self.events_accepted.clone());
        let _ = registry.register(self.events_rejected.clone());
        let _ = registry.register(self.events_persisted.clone());
        let _ = registry.register(self.events_deduplicated.clone());
        let _ = registry.register(self.events_dead_lettered.clone());
        let _ = registry.register(self.skipped_on_throttle.clone());
        let _ = registry.register(self.semaphore_acquired.clone());
        let _ = registry.register(self.semaphore_timeouts.clone());
        let _ = registry.register(self.queue_depth.clone());
        let _ = registry.register(self.memory_mb.clone());
        let _ = registry.register(self.processing_latency_ms.clone());
        let _ = registry.register(self.throttle_wait_ms.clone());
        let _ = registry.register(self.stage_failures.clone());
        let _ = registry.register(self.cache_hits.clone());
        let _ = registry.register(self.cache_misses.clone());
        let _ = registry.register(self.correlations_detected.clone());
        let _ = registry.register(self.broadcasts_sent.clone());
        let _ = registry.register(self.llm_requests.clone());
        let _ = registry.register(self.llm_latency_ms.clone());
        let _ = registry.register(self.llm_tokens.clone());
        let _ = registry.register(self.watcher_records.clone());
        let _ = registry.register(self.watcher_parse_errors.clone());
        let _ = registry.register(self.watcher_dropped.clone());
    }

    /// Semaphore acquisition success rate over process lifetime.
    pub fn semaphore_success_rate(&self) -> f64 {
        let acquired = self.semaphore_acquired.get() as f64;
        let timeouts = self.semaphore_timeouts.get() as f64;
        if acquired + timeouts == 0.0 {
            1.0
        } else {
            acquired / (acquired + timeouts)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetricsConfig;

    #[test]
    fn instruments_register_and_count() {
        let registry = MetricsRegistry::new(MetricsConfig {
            enabled: true,
            namespace: "sentinel_test".into(),
        });
        let metrics = PipelineMetrics::new(&registry);

        metrics.events_accepted.inc();
        metrics.semaphore_acquired.inc();
        metrics.semaphore_timeouts.inc();
        metrics.cache_hits.with_label_values(&["embedding"]).inc();

        assert_eq!(metrics.events_accepted.get(), 1);
        assert!((metrics.semaphore_success_rate() - 0.5).abs() < 1e-9);

        let text = registry.metrics_text();
        assert!(text.contains("pipeline_events_accepted_total"));
    }
}
