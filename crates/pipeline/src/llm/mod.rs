//! # LLM Analyzer
//!
//! Optional AI classification stage, invoked when the deterministic rule
//! confidence is below the configured threshold or no rule matched. Each
//! configured model is wrapped in a middleware chain (provider → resilience
//! → response cache → telemetry) and the chains are combined by the
//! [`Ensemble`] with voting, confidence aggregation and quorum handling.
//! Every failure mode degrades: the pipeline never loses an event because
//! analysis was unavailable.

pub mod ensemble;
pub mod middleware;
pub mod provider;
pub mod schema;

pub use ensemble::{Ensemble, EnsembleMember};
pub use middleware::{Cached, Resilient, Telemetry};
pub use provider::{Analyzer, AnalyzerResponse, ChatProvider, TokenUsage};
pub use schema::{parse_verdict, AnalysisRequest, AnalysisVerdict};

use sentinel_core::cache::CacheService;
use sentinel_core::config::LlmConfig;
use sentinel_core::error::Result;
use sentinel_core::metrics::PipelineMetrics;
use sentinel_core::types::{DetectionMethod, SearchHit, SecurityEvent};
use std::sync::Arc;
use std::time::Duration;

/// Facade owned by the orchestrator.
pub struct LlmAnalyzer {
    ensemble: Ensemble,
    rule_confidence_threshold: u8,
    enabled: bool,
    context_neighbors: usize,
}

impl LlmAnalyzer {
    pub fn new(config: &LlmConfig, cache: Arc<CacheService>, metrics: PipelineMetrics) -> Self {
        let timeout = Duration::from_secs(config.request_timeout_secs);
        let cool_off = Duration::from_secs(config.circuit_cool_off_secs);

        let members: Vec<EnsembleMember> = config
            .models
            .iter()
            .map(|model| {
                let base = ChatProvider::new(model.clone(), timeout);
                let resilient =
                    Resilient::new(base, config.circuit_failure_threshold, cool_off, timeout);
                let cached = Cached::new(resilient, Arc::clone(&cache));
                let telemetry = Telemetry::new(cached, metrics.clone());
                EnsembleMember {
                    analyzer: Arc::new(telemetry),
                    weight: model.weight,
                }
            })
            .collect();

        Self {
            ensemble: Ensemble::new(
                members,
                config.voting,
                config.confidence_aggregation,
                config.min_quorum,
                config.parallel,
            ),
            rule_confidence_threshold: config.rule_confidence_threshold,
            enabled: config.enabled && !config.models.is_empty(),
            context_neighbors: config.context_neighbors,
        }
    }

    /// How many vector-search neighbors to supply as analysis context.
    pub fn context_neighbors(&self) -> usize {
        self.context_neighbors
    }

    /// Whether this event should be analyzed at all.
    pub fn should_analyze(&self, event: &SecurityEvent, requires_ai: bool) -> bool {
        if !self.enabled {
            return false;
        }
        requires_ai || event.confidence < self.rule_confidence_threshold
    }

    /// Run the ensemble. Errors mean "no verdict available"; the caller
    /// keeps the deterministic classification and flags degradation.
    pub async fn analyze(
        &self,
        event: &SecurityEvent,
        neighbors: Vec<SearchHit>,
    ) -> Result<AnalysisVerdict> {
        let request = AnalysisRequest::new(event.clone(), neighbors);
        self.ensemble.analyze(&request).await
    }

    /// Merge a verdict into the event. The AI may raise or lower the
    /// pre-persistence classification (monotonicity only binds after
    /// persistence); detection method records the blended provenance.
    pub fn apply_verdict(event: &mut SecurityEvent, verdict: &AnalysisVerdict, had_rule: bool) {
        event.risk_level = verdict.risk_level;
        event.confidence = verdict.confidence;
        event.summary = format!("{}: {}", verdict.threat_classification, verdict.reasoning);
        for technique in &verdict.mitre_techniques {
            if !event.mitre_techniques.contains(technique) {
                event.mitre_techniques.push(technique.clone());
            }
        }
        for action in &verdict.recommended_actions {
            if !event.recommended_actions.contains(action) {
                event.recommended_actions.push(action.clone());
            }
        }
        event.detection_method = if had_rule {
            DetectionMethod::Hybrid
        } else {
            DetectionMethod::Ai
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::config::{CacheConfig, LlmModelConfig, MetricsConfig};
    use sentinel_core::metrics::MetricsRegistry;
    use sentinel_core::types::{RawRecord, RiskLevel};

    fn analyzer(enabled: bool, threshold: u8) -> LlmAnalyzer {
        let cache = Arc::new(CacheService::new(&CacheConfig::default()));
        let registry = MetricsRegistry::new(MetricsConfig {
            enabled: false,
            namespace: "test".into(),
        });
        LlmAnalyzer::new(
            &LlmConfig {
                enabled,
                models: vec![LlmModelConfig {
                    id: "test-model".into(),
                    endpoint: "http://localhost:9/v1/chat/completions".into(),
                    weight: 1.0,
                    api_key: None,
                }],
                rule_confidence_threshold: threshold,
                ..LlmConfig::default()
            },
            cache,
            PipelineMetrics::new(&registry),
        )
    }

    fn event(confidence: u8) -> SecurityEvent {
        let record = RawRecord {
            channel: "Security".into(),
            event_id: 4625,
            time_created: chrono::Utc::now(),
            xml_payload: "<Event/>".into(),
            host: "WIN-1".into(),
            bookmark_token: 1,
            fields: Default::default(),
        };
        let mut event = SecurityEvent::minimal(&record);
        event.confidence = confidence;
        event
    }

    #[test]
    fn analysis_gated_by_rule_confidence() {
        let analyzer = analyzer(true, 70);
        assert!(analyzer.should_analyze(&event(0), true));
        assert!(analyzer.should_analyze(&event(50), false));
        assert!(!analyzer.should_analyze(&event(85), false));
    }

    #[test]
    fn disabled_analyzer_never_runs() {
        let analyzer = analyzer(false, 70);
        assert!(!analyzer.should_analyze(&event(0), true));
    }

    #[test]
    fn verdict_merge_sets_provenance() {
        let verdict = AnalysisVerdict {
            risk_level: RiskLevel::Critical,
            confidence: 92,
            threat_classification: "credential_access".into(),
            mitre_techniques: vec!["T1110.001".into()],
            recommended_actions: vec!["Isolate host".into()],
            reasoning: "pattern of failures".into(),
        };

        let mut with_rule = event(40);
        with_rule.mitre_techniques = vec!["T1110.001".into()];
        LlmAnalyzer::apply_verdict(&mut with_rule, &verdict, true);
        assert_eq!(with_rule.detection_method, DetectionMethod::Hybrid);
        assert_eq!(with_rule.risk_level, RiskLevel::Critical);
        // Union without duplicates
        assert_eq!(with_rule.mitre_techniques, vec!["T1110.001"]);

        let mut without_rule = event(0);
        LlmAnalyzer::apply_verdict(&mut without_rule, &verdict, false);
        assert_eq!(without_rule.detection_method, DetectionMethod::Ai);
    }
}
