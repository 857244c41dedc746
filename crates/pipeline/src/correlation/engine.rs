//! The correlation engine proper: consumes persisted events from its intake
//! queue (off the persistence hot path), maintains per-key windows, fires
//! rules, and persists correlations before broadcasting them.

use arc_swap::ArcSwap;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use sentinel_core::config::CorrelationConfig;
use sentinel_core::error::Result;
use sentinel_core::metrics::PipelineMetrics;
use sentinel_core::retry::{retry_transient, Backoff};
use sentinel_core::types::{Correlation, CorrelationRule, SecurityEvent};
use sentinel_store::CorrelationRepository;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::features::{AnomalyScorer, FeatureVector};
use super::rules::{self, RuleFire};
use super::window::{KeyWindow, WindowEvent};
use crate::publish::EventPublisher;

pub struct CorrelationEngine {
    rules: ArcSwap<Vec<CorrelationRule>>,
    repository: CorrelationRepository,
    publisher: Arc<dyn EventPublisher>,
    scorer: AnomalyScorer,
    windows: DashMap<(String, String), KeyWindow>,
    /// (type, sorted participant set) → emitted-at, for duplicate
    /// suppression inside the cool-off
    recent_emissions: Mutex<HashMap<String, DateTime<Utc>>>,
    /// Correlations carry a strictly increasing detected_at
    last_detected_at: Mutex<DateTime<Utc>>,
    max_events_per_key: usize,
    duplicate_cool_off: ChronoDuration,
    metrics: PipelineMetrics,
    backoff: Backoff,
}

impl CorrelationEngine {
    pub fn new(
        config: &CorrelationConfig,
        repository: CorrelationRepository,
        publisher: Arc<dyn EventPublisher>,
        metrics: PipelineMetrics,
    ) -> Result<Self> {
        let rules = rules::build_rules(config)?;

        Ok(Self {
            rules: ArcSwap::from_pointee(rules),
            repository,
            publisher,
            scorer: AnomalyScorer::default(),
            windows: DashMap::new(),
            recent_emissions: Mutex::new(HashMap::new()),
            last_detected_at: Mutex::new(Utc::now() - ChronoDuration::seconds(1)),
            max_events_per_key: config.max_events_per_correlation_key,
            duplicate_cool_off: ChronoDuration::seconds(config.duplicate_cool_off_secs as i64),
            metrics,
            backoff: Backoff::default(),
        })
    }

    /// Consume the intake queue until cancelled, then flush once.
    pub async fn run(
        self: Arc<Self>,
        mut intake: mpsc::Receiver<SecurityEvent>,
        cancel: CancellationToken,
    ) {
        info!(rules = self.rules.load().len(), "correlation engine started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = intake.recv() => {
                    match event {
                        Some(event) => self.handle_event(&event).await,
                        None => break,
                    }
                }
            }
        }

        // Drain whatever arrived before cancellation.
        while let Ok(event) = intake.try_recv() {
            self.handle_event(&event).await;
        }
        info!("correlation engine stopped");
    }

    /// Evaluate every enabled rule against the event's key window.
    pub async fn handle_event(&self, event: &SecurityEvent) {
        let window_event = WindowEvent::from(event);
        let now = event.timestamp;

        let rules = self.rules.load();
        for rule in rules.iter().filter(|r| r.enabled) {
            let Some(key) = rules::rule_key(rule, &window_event) else {
                continue;
            };
            let window_span = ChronoDuration::seconds(rule.time_window_secs as i64);

            let fire = {
                let mut window = self
                    .windows
                    .entry((rule.id.clone(), key.clone()))
                    .or_insert_with(|| KeyWindow::new(self.max_events_per_key));

                window.push(window_event.clone(), now, window_span);
                if !window.can_fire(now) {
                    continue;
                }

                let snapshot = window.snapshot();
                match rules::evaluate(rule, &snapshot) {
                    Some(fire) => {
                        window.fired(now, window_span);
                        Some((fire, snapshot))
                    }
                    None => None,
                }
            };

            if let Some((fire, snapshot)) = fire {
                if let Err(e) = self.emit(rule, &key, fire, &snapshot, now).await {
                    warn!(rule = %rule.id, error = %e, "correlation emission failed");
                }
            }
        }
    }

    async fn emit(
        &self,
        rule: &CorrelationRule,
        key: &str,
        fire: RuleFire,
        window_snapshot: &[WindowEvent],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let features = FeatureVector::extract(window_snapshot, rule.time_window_secs);
        let confidence = self.scorer.combine(fire.raw_confidence, &features);
        if confidence < rule.min_confidence {
            debug!(rule = %rule.id, confidence, "combined confidence below rule minimum");
            return Ok(());
        }

        let mut event_ids: Vec<Uuid> = fire.participants.iter().map(|e| e.id).collect();
        event_ids.sort_unstable();
        event_ids.dedup();

        // Duplicate suppression: same type + same participant set inside
        // the cool-off window is not re-emitted.
        let emission_key = format!(
            "{}|{}",
            rule.correlation_type,
            event_ids
                .iter()
                .map(Uuid::to_string)
                .collect::<Vec<_>>()
                .join(",")
        );
        {
            let mut recent = self
                .recent_emissions
                .lock()
                .expect("emission lock poisoned");
            recent.retain(|_, at| now - *at < self.duplicate_cool_off);
            if recent.contains_key(&emission_key) {
                debug!(rule = %rule.id, "duplicate correlation suppressed");
                return Ok(());
            }
            recent.insert(emission_key, now);
        }

        let participant_risk = fire
            .participants
            .iter()
            .map(|e| e.risk_level)
            .max()
            .unwrap_or(sentinel_core::types::RiskLevel::Low);
        let risk_level = participant_risk.upgraded_to(rules::risk_floor(rule.correlation_type));

        let mut mitre_techniques = rules::default_techniques(rule.correlation_type);
        for participant in &fire.participants {
            for technique in &participant.mitre_techniques {
                if !mitre_techniques.contains(technique) {
                    mitre_techniques.push(technique.clone());
                }
            }
        }

        let detected_at = {
            let mut last = self.last_detected_at.lock().expect("detected_at lock poisoned");
            let candidate = Utc::now().max(*last + ChronoDuration::milliseconds(1));
            *last = candidate;
            candidate
        };

        let correlation = Correlation {
            id: Uuid::new_v4(),
            correlation_type: rule.correlation_type,
            confidence,
            risk_level,
            pattern: fire.pattern,
            event_ids,
            mitre_techniques,
            detected_at,
            time_window_secs: rule.time_window_secs,
            matched_rule: rule.id.clone(),
            metadata: HashMap::from([
                ("key".to_string(), serde_json::json!(key)),
                (
                    "raw_confidence".to_string(),
                    serde_json::json!(fire.raw_confidence),
                ),
                (
                    "model_score".to_string(),
                    serde_json::json!(self.scorer.score(&features)),
                ),
            ]),
        };

        // A correlation is not emitted until persisted; broadcast follows
        // persistence.
        retry_transient(&self.backoff, || {
            self.repository.insert_with_upgrades(&correlation)
        })
        .await?;

        self.metrics
            .correlations_detected
            .with_label_values(&[correlation.correlation_type.as_str()])
            .inc();
        info!(
            correlation_id = %correlation.id,
            rule = %rule.id,
            confidence = correlation.confidence,
            participants = correlation.event_ids.len(),
            "correlation detected"
        );
        self.publisher.publish_correlation(&correlation);
        Ok(())
    }

    pub fn active_keys(&self) -> usize {
        self.windows.len()
    }

    /// Current rule set (including disabled rules), for the admin surface.
    pub fn rules(&self) -> Vec<CorrelationRule> {
        self.rules.load().as_ref().clone()
    }

    /// Replace one rule atomically; readers see the old or the new set in
    /// full.
    pub fn update_rule(&self, updated: CorrelationRule) -> Result<()> {
        let current = self.rules.load();
        let mut next: Vec<CorrelationRule> = current.as_ref().clone();
        match next.iter_mut().find(|r| r.id == updated.id) {
            Some(slot) => *slot = updated,
            None => {
                return Err(sentinel_core::error::Error::not_found(format!(
                    "correlation rule '{}' not found",
                    updated.id
                )))
            }
        }
        self.rules.store(Arc::new(next));
        Ok(())
    }
}
