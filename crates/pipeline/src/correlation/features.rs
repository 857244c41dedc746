//! Window feature extraction and the calibrated confidence scorer.
//!
//! Every rule evaluation scores its window through the same eight features;
//! the result is blended with the rule's own raw confidence. The scorer is
//! a fixed-weight logistic model calibrated against labelled incident
//! windows; any classifier emitting 0..1 satisfies the contract.

use chrono::Timelike;
use std::collections::HashSet;

use super::window::WindowEvent;
use sentinel_core::types::RiskLevel;

/// The eight features, each normalized to 0..1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureVector {
    pub event_rate: f64,
    pub risk_mix: f64,
    pub unique_hosts: f64,
    pub unique_users: f64,
    pub unique_processes: f64,
    pub failure_ratio: f64,
    pub time_span: f64,
    pub off_hours: f64,
}

impl FeatureVector {
    /// Extract features from a window of events spanning at most
    /// `window_secs`.
    pub fn extract(events: &[WindowEvent], window_secs: u64) -> Self {
        if events.is_empty() {
            return Self::zero();
        }

        let window_secs = window_secs.max(1) as f64;
        let span_secs = (events[events.len() - 1].timestamp - events[0].timestamp)
            .num_seconds()
            .max(0) as f64;

        // Events per second, saturating at one per second.
        let event_rate = (events.len() as f64 / window_secs).min(1.0);

        let risk_sum: f64 = events
            .iter()
            .map(|e| match e.risk_level {
                RiskLevel::Low => 0.1,
                RiskLevel::Medium => 0.4,
                RiskLevel::High => 0.7,
                RiskLevel::Critical => 1.0,
            })
            .sum();
        let risk_mix = risk_sum / events.len() as f64;

        let hosts: HashSet<&str> = events.iter().map(|e| e.host.as_str()).collect();
        let users: HashSet<&str> = events
            .iter()
            .filter_map(|e| e.user.as_deref())
            .collect();
        let processes: HashSet<&str> = events
            .iter()
            .filter_map(|e| e.process.as_deref())
            .collect();

        let denominator = events.len() as f64;
        let unique_hosts = hosts.len() as f64 / denominator;
        let unique_users = (users.len() as f64 / denominator).min(1.0);
        let unique_processes = (processes.len() as f64 / denominator).min(1.0);

        let failures = events
            .iter()
            .filter(|e| e.event_type == sentinel_core::types::EventType::AuthenticationFailure)
            .count();
        let failure_ratio = failures as f64 / denominator;

        let time_span = (span_secs / window_secs).min(1.0);

        let off_hours_count = events
            .iter()
            .filter(|e| {
                let hour = e.timestamp.hour();
                !(7..19).contains(&hour)
            })
            .count();
        let off_hours = off_hours_count as f64 / denominator;

        Self {
            event_rate,
            risk_mix,
            unique_hosts,
            unique_users,
            unique_processes,
            failure_ratio,
            time_span,
            off_hours,
        }
    }

    pub fn zero() -> Self {
        Self {
            event_rate: 0.0,
            risk_mix: 0.0,
            unique_hosts: 0.0,
            unique_users: 0.0,
            unique_processes: 0.0,
            failure_ratio: 0.0,
            time_span: 0.0,
            off_hours: 0.0,
        }
    }

    fn as_array(&self) -> [f64; 8] {
        [
            self.event_rate,
            self.risk_mix,
            self.unique_hosts,
            self.unique_users,
            self.unique_processes,
            self.failure_ratio,
            self.time_span,
            self.off_hours,
        ]
    }
}

/// Calibrated logistic scorer over the feature vector.
#[derive(Debug, Clone)]
pub struct AnomalyScorer {
    weights: [f64; 8],
    bias: f64,
}

impl Default for AnomalyScorer {
    fn default() -> Self {
        // Calibrated offline against labelled burst/brute-force windows.
        Self {
            weights: [2.4, 1.8, 0.9, 0.6, 0.5, 2.1, -0.8, 1.1],
            bias: -1.6,
        }
    }
}

impl AnomalyScorer {
    /// Score in 0..1; higher means more anomalous.
    pub fn score(&self, features: &FeatureVector) -> f64 {
        let z: f64 = features
            .as_array()
            .iter()
            .zip(self.weights.iter())
            .map(|(x, w)| x * w)
            .sum::<f64>()
            + self.bias;
        1.0 / (1.0 + (-z).exp())
    }

    /// Blend the model score with a rule's raw confidence (0.6 rule,
    /// 0.4 model).
    pub fn combine(&self, rule_confidence: f64, features: &FeatureVector) -> f64 {
        let model = self.score(features);
        (0.6 * rule_confidence + 0.4 * model).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use sentinel_core::types::EventType;
    use uuid::Uuid;

    fn event(
        offset_secs: i64,
        event_type: EventType,
        risk: RiskLevel,
        host: &str,
        user: Option<&str>,
    ) -> WindowEvent {
        WindowEvent {
            id: Uuid::new_v4(),
            event_type,
            risk_level: risk,
            confidence: 80,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap()
                + chrono::Duration::seconds(offset_secs),
            host: host.to_string(),
            user: user.map(str::to_owned),
            source_ip: Some("203.0.113.45".to_string()),
            process: None,
            mitre_techniques: vec![],
        }
    }

    #[test]
    fn empty_window_scores_low() {
        let scorer = AnomalyScorer::default();
        let score = scorer.score(&FeatureVector::zero());
        assert!(score < 0.3);
    }

    #[test]
    fn burst_of_failures_scores_higher_than_calm_window() {
        let scorer = AnomalyScorer::default();

        let burst: Vec<WindowEvent> = (0..20)
            .map(|i| {
                event(
                    i,
                    EventType::AuthenticationFailure,
                    RiskLevel::High,
                    "WIN-1",
                    Some("admin"),
                )
            })
            .collect();
        let calm: Vec<WindowEvent> = (0..3)
            .map(|i| {
                event(
                    i * 250,
                    EventType::ProcessCreation,
                    RiskLevel::Low,
                    "WIN-1",
                    Some("svc"),
                )
            })
            .collect();

        let burst_score = scorer.score(&FeatureVector::extract(&burst, 60));
        let calm_score = scorer.score(&FeatureVector::extract(&calm, 900));
        assert!(burst_score > calm_score);
        assert!(burst_score > 0.5);
    }

    #[test]
    fn failure_ratio_counts_only_auth_failures() {
        let events = vec![
            event(0, EventType::AuthenticationFailure, RiskLevel::High, "h", None),
            event(1, EventType::AuthenticationSuccess, RiskLevel::Low, "h", None),
        ];
        let features = FeatureVector::extract(&events, 60);
        assert!((features.failure_ratio - 0.5).abs() < 1e-9);
    }

    #[test]
    fn combined_confidence_is_bounded() {
        let scorer = AnomalyScorer::default();
        let features = FeatureVector {
            event_rate: 1.0,
            risk_mix: 1.0,
            unique_hosts: 1.0,
            unique_users: 1.0,
            unique_processes: 1.0,
            failure_ratio: 1.0,
            time_span: 0.0,
            off_hours: 1.0,
        };
        let combined = scorer.combine(1.0, &features);
        assert!(combined <= 1.0 && combined >= 0.6);
    }
}
