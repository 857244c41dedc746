//! # Pipeline Orchestrator
//!
//! Runs every accepted raw record through the enrichment stage graph with
//! bounded concurrency:
//!
//! ```text
//! intake → rule detector → ⎧ embedding → vector search → LLM ⎫ → merge →
//!                          ⎩ IP enrichment                   ⎭
//!   persist (relational + batched vector) → correlation intake + hub
//! ```
//!
//! Stage tasks share a semaphore (`max_concurrent_tasks`) with a
//! configurable acquisition timeout; on timeout the stage either waits
//! (default) or is skipped with a degraded marker
//! (`skip_on_throttle_timeout`). Transient stage failures retry with
//! jittered backoff; anything that still fails degrades the event rather
//! than losing it, and persistence exhaustion diverts to the dead-letter
//! queue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sentinel_core::cache::CacheService;
use sentinel_core::config::PipelineConfig;
use sentinel_core::error::{Error, ErrorCode, Result};
use sentinel_core::metrics::PipelineMetrics;
use sentinel_core::retry::{retry_transient, Backoff};
use sentinel_core::types::{EventSummary, RawRecord, SecurityEvent};
use sentinel_store::{DeadLetterRepository, EventRepository, InsertOutcome};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batcher::VectorBatcher;
use crate::detector::RuleDetector;
use crate::embedding::EmbeddingClient;
use crate::enrich::IpEnricher;
use crate::llm::{AnalysisVerdict, LlmAnalyzer};
use crate::pressure::AdaptiveThrottle;
use crate::publish::EventPublisher;
use crate::vector::{VectorPoint, VectorStoreClient};
use crate::watcher::{ChannelBuffer, RecordSink};

/// REST-visible orchestrator counters.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PipelineCounters {
    pub events_per_second: f64,
    pub avg_latency_ms: f64,
    pub queue_depth: usize,
    pub avg_throttle_wait_ms: f64,
    pub semaphore_acquire_success_rate: f64,
    pub memory_mb: i64,
    pub events_persisted: u64,
    pub events_deduplicated: u64,
    pub dead_letters: u64,
    pub skipped_on_throttle: u64,
}

#[derive(Default)]
struct AnalysisOutcome {
    vector: Option<Vec<f32>>,
    verdict: Option<AnalysisVerdict>,
    degraded: bool,
}

pub struct Orchestrator {
    config: PipelineConfig,
    /// One intake shard per worker; records are routed by channel hash so
    /// per-channel processing (and thus persistence) stays ordered.
    intake: Vec<ChannelBuffer<RawRecord>>,
    semaphore: Arc<Semaphore>,
    throttle: Arc<AdaptiveThrottle>,
    dedup_seen: DashMap<String, DateTime<Utc>>,
    detector: Arc<RuleDetector>,
    embedding: Arc<EmbeddingClient>,
    vector: Arc<VectorStoreClient>,
    llm: Arc<LlmAnalyzer>,
    enricher: Arc<IpEnricher>,
    events: EventRepository,
    dead_letters: DeadLetterRepository,
    batcher: VectorBatcher,
    correlation_tx: mpsc::Sender<SecurityEvent>,
    publisher: Arc<dyn EventPublisher>,
    cache: Arc<CacheService>,
    metrics: PipelineMetrics,
    cancel: CancellationToken,
    write_backoff: Backoff,
    stage_backoff: Backoff,
    /// Recent completion instants for the events-per-second gauge
    completions: Mutex<VecDeque<Instant>>,
    /// Retained recent event summaries (trimmed by retention/pressure)
    history: Mutex<VecDeque<(DateTime<Utc>, EventSummary)>>,
    latency_sum_us: AtomicU64,
    latency_count: AtomicU64,
    throttle_wait_sum_us: AtomicU64,
    throttle_wait_count: AtomicU64,
}

#[allow(clippy::too_many_arguments)]
impl Orchestrator {
    pub fn new(
        config: PipelineConfig,
        detector: Arc<RuleDetector>,
        embedding: Arc<EmbeddingClient>,
        vector: Arc<VectorStoreClient>,
        llm: Arc<LlmAnalyzer>,
        enricher: Arc<IpEnricher>,
        events: EventRepository,
        dead_letters: DeadLetterRepository,
        batcher: VectorBatcher,
        correlation_tx: mpsc::Sender<SecurityEvent>,
        publisher: Arc<dyn EventPublisher>,
        cache: Arc<CacheService>,
        metrics: PipelineMetrics,
        cancel: CancellationToken,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_tasks));
        let throttle = Arc::new(AdaptiveThrottle::new(
            Arc::clone(&semaphore),
            config.max_concurrent_tasks,
        ));
        let intake_policy = if config.drop_oldest_on_full {
            sentinel_core::config::OverflowPolicy::DropOldest
        } else {
            sentinel_core::config::OverflowPolicy::Block
        };
        let shards = config.max_concurrency.max(1);
        let shard_capacity = (config.max_queue_depth / shards).max(1);
        let intake = (0..shards)
            .map(|_| ChannelBuffer::new(shard_capacity, intake_policy))
            .collect();

        Self {
            intake,
            semaphore,
            throttle,
            dedup_seen: DashMap::new(),
            detector,
            embedding,
            vector,
            llm,
            enricher,
            events,
            dead_letters,
            batcher,
            correlation_tx,
            publisher,
            cache,
            metrics,
            cancel,
            write_backoff: Backoff::default(),
            stage_backoff: Backoff::default(),
            completions: Mutex::new(VecDeque::new()),
            history: Mutex::new(VecDeque::new()),
            latency_sum_us: AtomicU64::new(0),
            latency_count: AtomicU64::new(0),
            throttle_wait_sum_us: AtomicU64::new(0),
            throttle_wait_count: AtomicU64::new(0),
            config,
        }
    }

    pub fn throttle(&self) -> Arc<AdaptiveThrottle> {
        Arc::clone(&self.throttle)
    }

    /// Spawn the worker pool plus the orchestrator's periodic maintenance
    /// tasks.
    pub fn start(self: Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        for worker in 0..self.config.max_concurrency {
            let this = Arc::clone(&self);
            handles.push(tokio::spawn(async move { this.worker_loop(worker).await }));
        }

        let this = Arc::clone(&self);
        handles.push(tokio::spawn(async move { this.maintenance_loop().await }));
        let this = Arc::clone(&self);
        handles.push(tokio::spawn(async move { this.dead_letter_loop().await }));

        handles
    }

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        debug!(worker, "pipeline worker started");
        let shard = &self.intake[worker];
        loop {
            let record = tokio::select! {
                _ = self.cancel.cancelled() => break,
                record = shard.pop() => record,
            };
            self.metrics.queue_depth.set(self.queue_depth() as i64);
            self.process_record(record).await;
        }

        // Drain what is already queued before exiting.
        while let Some(record) = shard.try_pop() {
            self.process_record(record).await;
        }
        debug!(worker, "pipeline worker stopped");
    }

    /// Total queued records across intake shards.
    fn queue_depth(&self) -> usize {
        self.intake.iter().map(|shard| shard.len()).sum()
    }

    /// Stable shard assignment: one channel always lands on one worker, so
    /// records of a channel persist in source order.
    fn shard_for(&self, channel: &str) -> usize {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        channel.hash(&mut hasher);
        (hasher.finish() as usize) % self.intake.len()
    }

    /// Full stage graph for one record.
    async fn process_record(&self, record: RawRecord) {
        let started = Instant::now();

        let detection = self.detector.classify(&record);
        let had_rule = detection.matched_rule.is_some();
        let mut event = detection.event;

        // Parallel enrichment: analysis chain (embedding → search → LLM)
        // alongside IP enrichment.
        let (analysis, enrichment) = tokio::join!(
            self.analysis_branch(&event, detection.requires_ai),
            self.enrichment_branch(&event),
        );

        if let Some(verdict) = &analysis.verdict {
            LlmAnalyzer::apply_verdict(&mut event, verdict, had_rule);
        }
        if analysis.degraded {
            event.degraded = true;
        }
        event.ip_enrichment = enrichment;
        if analysis.vector.is_some() {
            event.embedding_ref = Some(event.id);
        }

        self.persist_and_publish(event, analysis.vector).await;

        let elapsed = started.elapsed();
        self.metrics
            .processing_latency_ms
            .observe(elapsed.as_secs_f64() * 1_000.0);
        self.latency_sum_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
        {
            let mut completions = self.completions.lock().expect("completions lock poisoned");
            let now = Instant::now();
            completions.push_back(now);
            while let Some(front) = completions.front() {
                if now.duration_since(*front) > Duration::from_secs(60) {
                    completions.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    async fn analysis_branch(
        &self,
        event: &SecurityEvent,
        requires_ai: bool,
    ) -> AnalysisOutcome {
        let mut outcome = AnalysisOutcome::default();
        let canonical = event.canonical_text();

        // Embedding
        let vector = match self.run_stage("embedding", || self.embedding.embed(&canonical)).await
        {
            StageResult::Ok(vector) => Some(vector),
            StageResult::Skipped => {
                outcome.degraded = true;
                None
            }
            StageResult::Failed => {
                outcome.degraded = true;
                None
            }
        };
        outcome.vector = vector.clone();

        // Vector search for LLM context
        let neighbors = match &vector {
            Some(vector) => {
                match self
                    .run_stage("vector_search", || {
                        self.vector.search(vector, self.llm.context_neighbors(), None)
                    })
                    .await
                {
                    StageResult::Ok(hits) => hits,
                    _ => Vec::new(),
                }
            }
            None => Vec::new(),
        };

        // LLM analysis
        if self.llm.should_analyze(event, requires_ai) {
            match self
                .run_stage("llm", || self.llm.analyze(event, neighbors.clone()))
                .await
            {
                StageResult::Ok(verdict) => outcome.verdict = Some(verdict),
                StageResult::Skipped | StageResult::Failed => outcome.degraded = true,
            }
        }

        outcome
    }

    async fn enrichment_branch(
        &self,
        event: &SecurityEvent,
    ) -> Option<sentinel_core::types::IpEnrichment> {
        let source_ip = event.source_ip.clone()?;
        match self.acquire_stage_permit().await {
            Ok(Some(_permit)) => self.enricher.enrich(&source_ip).await,
            // Enrichment is optional: a throttle skip just drops it.
            _ => None,
        }
    }

    /// Run one stage under the semaphore with timeout and transient retry.
    async fn run_stage<T, F, Fut>(&self, stage: &'static str, operation: F) -> StageResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let permit = match self.acquire_stage_permit().await {
            Ok(Some(permit)) => permit,
            Ok(None) => {
                self.metrics
                    .stage_failures
                    .with_label_values(&[stage, "throttle_skip"])
                    .inc();
                return StageResult::Skipped;
            }
            Err(_) => return StageResult::Failed,
        };
        let _permit: OwnedSemaphorePermit = permit;

        let attempt = retry_transient(&self.stage_backoff, || async {
            match tokio::time::timeout(
                Duration::from_millis(self.config.parallel_operation_timeout_ms),
                operation(),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(Error::new(
                    ErrorCode::StageTimeout,
                    format!("{} stage timed out", stage),
                )),
            }
        })
        .await;

        match attempt {
            Ok(value) => StageResult::Ok(value),
            Err(e) => {
                self.metrics
                    .stage_failures
                    .with_label_values(&[stage, disposition(&e)])
                    .inc();
                debug!(stage, error = %e, "stage degraded");
                StageResult::Failed
            }
        }
    }

    async fn acquire_stage_permit(&self) -> Result<Option<OwnedSemaphorePermit>> {
        let started = Instant::now();
        let acquire = Arc::clone(&self.semaphore).acquire_owned();

        match tokio::time::timeout(
            Duration::from_millis(self.config.semaphore_timeout_ms),
            acquire,
        )
        .await
        {
            Ok(Ok(permit)) => {
                self.note_throttle_wait(started);
                self.metrics.semaphore_acquired.inc();
                Ok(Some(permit))
            }
            Ok(Err(_)) => Err(Error::new(ErrorCode::ShuttingDown, "semaphore closed")),
            Err(_) => {
                self.metrics.semaphore_timeouts.inc();
                if self.config.skip_on_throttle_timeout {
                    self.metrics.skipped_on_throttle.inc();
                    Ok(None)
                } else {
                    // Default behavior: keep waiting for a permit.
                    let permit = Arc::clone(&self.semaphore)
                        .acquire_owned()
                        .await
                        .map_err(|_| Error::new(ErrorCode::ShuttingDown, "semaphore closed"))?;
                    self.note_throttle_wait(started);
                    self.metrics.semaphore_acquired.inc();
                    Ok(Some(permit))
                }
            }
        }
    }

    fn note_throttle_wait(&self, started: Instant) {
        let waited = started.elapsed();
        self.metrics
            .throttle_wait_ms
            .observe(waited.as_secs_f64() * 1_000.0);
        self.throttle_wait_sum_us
            .fetch_add(waited.as_micros() as u64, Ordering::Relaxed);
        self.throttle_wait_count.fetch_add(1, Ordering::Relaxed);
    }

    async fn persist_and_publish(&self, event: SecurityEvent, vector: Option<Vec<f32>>) {
        let insert = retry_transient(&self.write_backoff, || self.events.insert(&event)).await;

        match insert {
            Ok(InsertOutcome::Inserted) => {
                self.metrics.events_persisted.inc();

                if let Some(vector) = vector {
                    self.batcher
                        .enqueue(VectorPoint {
                            id: event.id,
                            vector,
                            metadata: std::collections::HashMap::from([
                                ("event_type".to_string(), event.event_type.to_string()),
                                ("risk_level".to_string(), event.risk_level.to_string()),
                                (
                                    "timestamp".to_string(),
                                    event.timestamp.timestamp().to_string(),
                                ),
                            ]),
                        })
                        .await;
                }

                if self.correlation_tx.send(event.clone()).await.is_err() {
                    warn!("correlation intake closed; event not correlated");
                }
                self.publisher.publish_event(event.summary_view());
                self.metrics
                    .broadcasts_sent
                    .with_label_values(&["security_event"])
                    .inc();

                let mut history = self.history.lock().expect("history lock poisoned");
                history.push_back((Utc::now(), event.summary_view()));
                let cutoff = Utc::now()
                    - chrono::Duration::minutes(self.config.event_history_retention_minutes as i64);
                while history
                    .front()
                    .map(|(at, _)| *at < cutoff)
                    .unwrap_or(false)
                {
                    history.pop_front();
                }
            }
            Ok(InsertOutcome::Duplicate) => {
                self.metrics.events_deduplicated.inc();
                debug!(event_id = %event.id, "duplicate event suppressed at persistence");
            }
            Err(e) => {
                self.metrics.events_dead_lettered.inc();
                let detail = e.to_string();
                if let Err(divert_err) = self
                    .dead_letters
                    .divert(&event, "PersistenceExhausted", Some(&detail))
                    .await
                {
                    error!(
                        event_id = %event.id,
                        error = %divert_err,
                        "dead-letter diversion failed; event lost from store until source replay"
                    );
                }
            }
        }
    }

    /// Dedup purge, rule-cache TTL refresh and cache expiry sweep.
    async fn maintenance_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    let window =
                        chrono::Duration::minutes(self.config.dedup_window_minutes as i64);
                    let now = Utc::now();
                    self.dedup_seen.retain(|_, seen| now - *seen < window);

                    self.detector.refresh_if_stale().await;
                    self.cache.purge_expired();
                    self.cache.enforce_global_bound();
                }
            }
        }
    }

    /// Redeliver due dead letters with monotonic retry.
    async fn dead_letter_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    let due = match self.dead_letters.due(50).await {
                        Ok(due) => due,
                        Err(e) => {
                            debug!(error = %e, "dead-letter scan failed");
                            continue;
                        }
                    };
                    for letter in due {
                        let redelivered = match letter.event() {
                            Ok(event) => self.events.insert(&event).await.is_ok(),
                            Err(_) => false,
                        };
                        let result = if redelivered {
                            info!(dead_letter_id = letter.id, "dead letter redelivered");
                            self.dead_letters.resolve(letter.id).await
                        } else {
                            self.dead_letters.mark_retry_failed(letter.id).await
                        };
                        if let Err(e) = result {
                            debug!(error = %e, "dead-letter bookkeeping failed");
                        }
                    }
                }
            }
        }
    }

    pub fn counters(&self) -> PipelineCounters {
        let latency_count = self.latency_count.load(Ordering::Relaxed);
        let avg_latency_ms = if latency_count == 0 {
            0.0
        } else {
            self.latency_sum_us.load(Ordering::Relaxed) as f64 / latency_count as f64 / 1_000.0
        };
        let wait_count = self.throttle_wait_count.load(Ordering::Relaxed);
        let avg_throttle_wait_ms = if wait_count == 0 {
            0.0
        } else {
            self.throttle_wait_sum_us.load(Ordering::Relaxed) as f64 / wait_count as f64 / 1_000.0
        };
        let events_per_second = {
            let completions = self.completions.lock().expect("completions lock poisoned");
            completions.len() as f64 / 60.0
        };

        PipelineCounters {
            events_per_second,
            avg_latency_ms,
            queue_depth: self.queue_depth(),
            avg_throttle_wait_ms,
            semaphore_acquire_success_rate: self.metrics.semaphore_success_rate(),
            memory_mb: self.metrics.memory_mb.get(),
            events_persisted: self.metrics.events_persisted.get(),
            events_deduplicated: self.metrics.events_deduplicated.get(),
            dead_letters: self.metrics.events_dead_lettered.get(),
            skipped_on_throttle: self.metrics.skipped_on_throttle.get(),
        }
    }

    /// Recent event summaries retained in memory.
    pub fn recent_history(&self, limit: usize) -> Vec<EventSummary> {
        let history = self.history.lock().expect("history lock poisoned");
        history
            .iter()
            .rev()
            .take(limit)
            .map(|(_, summary)| summary.clone())
            .collect()
    }
}

enum StageResult<T> {
    Ok(T),
    Skipped,
    Failed,
}

fn disposition(error: &Error) -> &'static str {
    match error.kind() {
        sentinel_core::error::ErrorKind::Transient => "exhausted",
        sentinel_core::error::ErrorKind::Degraded => "degraded",
        sentinel_core::error::ErrorKind::Validation => "rejected",
        _ => "fatal",
    }
}

#[async_trait]
impl RecordSink for Orchestrator {
    /// Accept a record into the bounded intake queue.
    ///
    /// - duplicate inside the dedup window → accepted and suppressed;
    /// - queue full with `drop_oldest_on_full = false` → `QueueFull`
    ///   (the watcher retries, which blocks the subscription);
    /// - queue full with `drop_oldest_on_full = true` → oldest dropped.
    async fn submit(&self, record: RawRecord) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::new(ErrorCode::ShuttingDown, "intake stopped"));
        }

        let dedup_key = record.dedup_key();
        let window = chrono::Duration::minutes(self.config.dedup_window_minutes as i64);
        let now = Utc::now();
        if let Some(seen) = self.dedup_seen.get(&dedup_key) {
            if now - *seen < window {
                self.metrics.events_deduplicated.inc();
                return Ok(());
            }
        }

        let shard = self.shard_for(&record.channel);
        match self.intake[shard].try_push(record) {
            Ok(dropped) => {
                // Key registered only once the record is actually queued, so
                // a rejected submission can be retried.
                self.dedup_seen.insert(dedup_key, now);
                if dropped > 0 {
                    self.metrics.events_rejected.inc();
                    warn!("intake full; oldest queued record dropped");
                }
                self.metrics.events_accepted.inc();
                self.metrics.queue_depth.set(self.queue_depth() as i64);
                Ok(())
            }
            Err(_rejected) => {
                self.metrics.events_rejected.inc();
                Err(Error::new(
                    ErrorCode::QueueFull,
                    "pipeline intake queue is full",
                ))
            }
        }
    }
}
