//! # Rule Detector
//!
//! Deterministic first-pass classification: an enabled [`DetectionRule`]
//! keyed by `(channel, event_id)` stamps the initial event; records without
//! a match get a minimal event flagged for AI analysis.
//!
//! The enabled rule set is held as an immutable snapshot behind an
//! `ArcSwap`, refreshed on a TTL and on explicit invalidation after admin
//! writes. A rule-store outage keeps serving the last good snapshot in
//! degraded mode.

use arc_swap::ArcSwap;
use sentinel_core::error::Result;
use sentinel_core::types::{DetectionMethod, DetectionRule, RawRecord, SecurityEvent};
use sentinel_store::RuleRepository;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

const DEFAULT_REFRESH_TTL: Duration = Duration::from_secs(15 * 60);

/// Classification outcome for one record.
#[derive(Debug, Clone)]
pub struct Detection {
    pub event: SecurityEvent,
    /// Present when a rule matched
    pub matched_rule: Option<DetectionRule>,
    /// No rule matched: the LLM stage should run regardless of thresholds
    pub requires_ai: bool,
}

type RuleMap = HashMap<(String, u32), DetectionRule>;

pub struct RuleDetector {
    repository: RuleRepository,
    snapshot: ArcSwap<RuleMap>,
    refresh_ttl: Duration,
    last_refresh: Mutex<Instant>,
    degraded: AtomicBool,
}

impl RuleDetector {
    pub fn new(repository: RuleRepository) -> Self {
        Self {
            repository,
            snapshot: ArcSwap::from_pointee(RuleMap::new()),
            refresh_ttl: DEFAULT_REFRESH_TTL,
            last_refresh: Mutex::new(Instant::now()),
            degraded: AtomicBool::new(false),
        }
    }

    /// Load the full enabled set and swap it in atomically. Callers invoke
    /// this at startup and after admin writes; a concurrent reader sees the
    /// old or the new map in full, never a partial state.
    pub async fn refresh(&self) -> Result<usize> {
        match self.repository.load_enabled().await {
            Ok(rules) => {
                let map: RuleMap = rules
                    .into_iter()
                    .map(|rule| ((rule.channel.clone(), rule.event_id), rule))
                    .collect();
                let count = map.len();
                self.snapshot.store(Arc::new(map));
                *self.last_refresh.lock().await = Instant::now();
                if self.degraded.swap(false, Ordering::Relaxed) {
                    info!("rule cache recovered from degraded mode");
                }
                Ok(count)
            }
            Err(e) => {
                // Serve the last known good set.
                if !self.degraded.swap(true, Ordering::Relaxed) {
                    warn!(error = %e, "rule store unavailable; serving last known rule set");
                }
                Err(e)
            }
        }
    }

    /// Explicit invalidation after an admin write.
    pub async fn invalidate(&self) {
        if let Err(e) = self.refresh().await {
            warn!(error = %e, "rule cache invalidation refresh failed");
        }
    }

    /// TTL-driven refresh, called opportunistically by the classify path's
    /// owner (the orchestrator's periodic task).
    pub async fn refresh_if_stale(&self) {
        let stale = {
            let last = self.last_refresh.lock().await;
            last.elapsed() >= self.refresh_ttl
        };
        if stale {
            let _ = self.refresh().await;
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn rule_count(&self) -> usize {
        self.snapshot.load().len()
    }

    /// Classify one record. Pure lookup on the current snapshot.
    pub fn classify(&self, record: &RawRecord) -> Detection {
        let snapshot = self.snapshot.load();
        let mut event = SecurityEvent::minimal(record);

        match snapshot.get(&(record.channel.clone(), record.event_id)) {
            Some(rule) => {
                event.event_type = rule.event_type;
                event.risk_level = rule.risk_level;
                event.confidence = rule.confidence;
                event.summary = rule.summary.clone();
                event.mitre_techniques = rule.mitre_techniques.clone();
                event.recommended_actions = rule.recommended_actions.clone();
                event.detection_method = DetectionMethod::Deterministic;
                Detection {
                    event,
                    matched_rule: Some(rule.clone()),
                    requires_ai: false,
                }
            }
            None => Detection {
                event,
                matched_rule: None,
                requires_ai: true,
            },
        }
    }

    /// Swap in a prebuilt rule set; test seam.
    #[doc(hidden)]
    pub fn install_rules(&self, rules: Vec<DetectionRule>) {
        let map: RuleMap = rules
            .into_iter()
            .map(|rule| ((rule.channel.clone(), rule.event_id), rule))
            .collect();
        self.snapshot.store(Arc::new(map));
    }
}

#[cfg(test)]
pub(crate) fn test_rule(channel: &str, event_id: u32) -> DetectionRule {
    use sentinel_core::types::{EventType, RiskLevel};
    DetectionRule {
        id: 1,
        event_id,
        channel: channel.to_string(),
        event_type: EventType::AuthenticationFailure,
        risk_level: RiskLevel::High,
        confidence: 85,
        summary: "Failed logon attempt".to_string(),
        mitre_techniques: vec!["T1110.001".to_string()],
        recommended_actions: vec!["Review source address".to_string()],
        enabled: true,
        priority: 10,
        tags: vec!["authentication".to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sentinel_core::types::{EventType, RiskLevel};

    fn record(channel: &str, event_id: u32) -> RawRecord {
        RawRecord {
            channel: channel.to_string(),
            event_id,
            time_created: Utc::now(),
            xml_payload: "<Event/>".to_string(),
            host: "WIN-SERVER01".to_string(),
            bookmark_token: 1,
            fields: HashMap::new(),
        }
    }

    fn detector_with(rules: Vec<DetectionRule>) -> RuleDetector {
        // The repository is never reached: install_rules seeds the snapshot.
        let detector = RuleDetector::new(RuleRepository::new(
            sqlx::PgPool::connect_lazy("postgresql://sentinel@localhost/sentinel").unwrap(),
        ));
        detector.install_rules(rules);
        detector
    }

    #[tokio::test]
    async fn matching_rule_stamps_classification() {
        let detector = detector_with(vec![test_rule("Security", 4625)]);
        let detection = detector.classify(&record("Security", 4625));

        assert!(!detection.requires_ai);
        assert_eq!(detection.event.event_type, EventType::AuthenticationFailure);
        assert_eq!(detection.event.risk_level, RiskLevel::High);
        assert_eq!(detection.event.confidence, 85);
        assert_eq!(detection.event.mitre_techniques, vec!["T1110.001"]);
        assert_eq!(
            detection.event.detection_method,
            DetectionMethod::Deterministic
        );
    }

    #[tokio::test]
    async fn unmatched_record_is_minimal_and_flagged_for_ai() {
        let detector = detector_with(vec![test_rule("Security", 4625)]);
        let detection = detector.classify(&record("Security", 4688));

        assert!(detection.requires_ai);
        assert_eq!(detection.event.event_type, EventType::Other);
        assert_eq!(detection.event.risk_level, RiskLevel::Low);
        assert_eq!(detection.event.confidence, 0);
    }

    #[tokio::test]
    async fn channel_distinguishes_same_event_id() {
        let detector = detector_with(vec![test_rule("Security", 4625)]);
        let detection = detector.classify(&record("Application", 4625));
        assert!(detection.requires_ai);
    }

    #[tokio::test]
    async fn install_replaces_whole_snapshot() {
        let detector = detector_with(vec![test_rule("Security", 4625)]);
        detector.install_rules(vec![test_rule("Security", 4740)]);

        assert!(detector.classify(&record("Security", 4625)).requires_ai);
        assert!(!detector.classify(&record("Security", 4740)).requires_ai);
        assert_eq!(detector.rule_count(), 1);
    }
}
