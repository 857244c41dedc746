//! Multi-model ensemble. Members run in parallel (or sequentially), their
//! verdicts are combined by the configured voting strategy and confidence
//! aggregation, and a quorum of successful responses is required; on
//! shortfall the highest-weight single response wins, and with no responses
//! at all the caller falls back to the deterministic classification.

use futures::future::join_all;
use sentinel_core::config::{ConfidenceAggregation, VotingStrategy};
use sentinel_core::error::{Error, ErrorCode, Result};
use sentinel_core::types::RiskLevel;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::provider::Analyzer;
use super::schema::{AnalysisRequest, AnalysisVerdict};

pub struct EnsembleMember {
    pub analyzer: Arc<dyn Analyzer>,
    pub weight: f64,
}

pub struct Ensemble {
    members: Vec<EnsembleMember>,
    voting: VotingStrategy,
    aggregation: ConfidenceAggregation,
    min_quorum: usize,
    parallel: bool,
}

impl Ensemble {
    pub fn new(
        members: Vec<EnsembleMember>,
        voting: VotingStrategy,
        aggregation: ConfidenceAggregation,
        min_quorum: usize,
        parallel: bool,
    ) -> Self {
        Self {
            members,
            voting,
            aggregation,
            min_quorum,
            parallel,
        }
    }

    /// Run the ensemble. `Err` only when no member produced a verdict.
    pub async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisVerdict> {
        let mut successes: Vec<(usize, AnalysisVerdict)> = Vec::new();

        if self.parallel {
            let futures = self
                .members
                .iter()
                .map(|member| member.analyzer.analyze(request));
            for (idx, result) in join_all(futures).await.into_iter().enumerate() {
                match result {
                    Ok(response) => successes.push((idx, response.verdict)),
                    Err(e) => debug!(model = self.members[idx].analyzer.id(), error = %e, "ensemble member failed"),
                }
            }
        } else {
            for (idx, member) in self.members.iter().enumerate() {
                match member.analyzer.analyze(request).await {
                    Ok(response) => successes.push((idx, response.verdict)),
                    Err(e) => debug!(model = member.analyzer.id(), error = %e, "ensemble member failed"),
                }
            }
        }

        if successes.is_empty() {
            return Err(Error::new(
                ErrorCode::EnsembleQuorumShortfall,
                "no ensemble member produced a verdict",
            ));
        }

        if successes.len() < self.min_quorum {
            // Quorum shortfall: highest-weight single response wins.
            warn!(
                responses = successes.len(),
                quorum = self.min_quorum,
                "ensemble quorum shortfall, using highest-weight response"
            );
            let (_, verdict) = successes
                .into_iter()
                .max_by(|(a, _), (b, _)| {
                    self.members[*a]
                        .weight
                        .total_cmp(&self.members[*b].weight)
                })
                .expect("non-empty successes");
            return Ok(verdict);
        }

        self.combine(successes)
    }

    fn combine(&self, successes: Vec<(usize, AnalysisVerdict)>) -> Result<AnalysisVerdict> {
        let winning_risk = self.vote_risk(&successes)?;
        let confidence = self.aggregate_confidence(&successes);

        // The highest-weight member that voted for the winning category
        // supplies the narrative fields.
        let narrator = successes
            .iter()
            .filter(|(_, v)| v.risk_level == winning_risk)
            .max_by(|(a, _), (b, _)| {
                self.members[*a].weight.total_cmp(&self.members[*b].weight)
            })
            .unwrap_or(&successes[0]);

        let mut mitre_techniques: Vec<String> = Vec::new();
        let mut recommended_actions: Vec<String> = Vec::new();
        for (_, verdict) in &successes {
            for technique in &verdict.mitre_techniques {
                if !mitre_techniques.contains(technique) {
                    mitre_techniques.push(technique.clone());
                }
            }
            for action in &verdict.recommended_actions {
                if !recommended_actions.contains(action) {
                    recommended_actions.push(action.clone());
                }
            }
        }

        Ok(AnalysisVerdict {
            risk_level: winning_risk,
            confidence,
            threat_classification: narrator.1.threat_classification.clone(),
            mitre_techniques,
            recommended_actions,
            reasoning: narrator.1.reasoning.clone(),
        })
    }

    fn vote_risk(&self, successes: &[(usize, AnalysisVerdict)]) -> Result<RiskLevel> {
        match self.voting {
            VotingStrategy::Majority => {
                let mut counts: HashMap<RiskLevel, usize> = HashMap::new();
                for (_, verdict) in successes {
                    *counts.entry(verdict.risk_level).or_default() += 1;
                }
                let best_count = counts.values().copied().max().unwrap_or(0);
                let tied: Vec<RiskLevel> = counts
                    .iter()
                    .filter(|(_, c)| **c == best_count)
                    .map(|(r, _)| *r)
                    .collect();
                if tied.len() == 1 {
                    Ok(tied[0])
                } else {
                    // Tie broken by the highest-weighted model's vote.
                    successes
                        .iter()
                        .filter(|(_, v)| tied.contains(&v.risk_level))
                        .max_by(|(a, _), (b, _)| {
                            self.members[*a].weight.total_cmp(&self.members[*b].weight)
                        })
                        .map(|(_, v)| v.risk_level)
                        .ok_or_else(|| {
                            Error::new(ErrorCode::EnsembleQuorumShortfall, "empty vote")
                        })
                }
            }
            VotingStrategy::Weighted => {
                let mut weights: HashMap<RiskLevel, f64> = HashMap::new();
                for (idx, verdict) in successes {
                    *weights.entry(verdict.risk_level).or_default() += self.members[*idx].weight;
                }
                weights
                    .into_iter()
                    .max_by(|(_, a), (_, b)| a.total_cmp(b))
                    .map(|(risk, _)| risk)
                    .ok_or_else(|| Error::new(ErrorCode::EnsembleQuorumShortfall, "empty vote"))
            }
            VotingStrategy::Unanimous => {
                let first = successes[0].1.risk_level;
                if successes.iter().all(|(_, v)| v.risk_level == first) {
                    Ok(first)
                } else {
                    Err(Error::new(
                        ErrorCode::EnsembleQuorumShortfall,
                        "ensemble members disagree under unanimous voting",
                    ))
                }
            }
        }
    }

    fn aggregate_confidence(&self, successes: &[(usize, AnalysisVerdict)]) -> u8 {
        let mut confidences: Vec<f64> = successes
            .iter()
            .map(|(_, v)| v.confidence as f64)
            .collect();
        confidences.sort_by(|a, b| a.total_cmp(b));

        let value = match self.aggregation {
            ConfidenceAggregation::Mean => {
                confidences.iter().sum::<f64>() / confidences.len() as f64
            }
            ConfidenceAggregation::Median => {
                let mid = confidences.len() / 2;
                if confidences.len() % 2 == 0 {
                    (confidences[mid - 1] + confidences[mid]) / 2.0
                } else {
                    confidences[mid]
                }
            }
            ConfidenceAggregation::Min => confidences[0],
            ConfidenceAggregation::Max => confidences[confidences.len() - 1],
            ConfidenceAggregation::WeightedMean => {
                let total_weight: f64 = successes
                    .iter()
                    .map(|(idx, _)| self.members[*idx].weight)
                    .sum();
                if total_weight == 0.0 {
                    confidences.iter().sum::<f64>() / confidences.len() as f64
                } else {
                    successes
                        .iter()
                        .map(|(idx, v)| self.members[*idx].weight * v.confidence as f64)
                        .sum::<f64>()
                        / total_weight
                }
            }
        };

        value.round().clamp(0.0, 100.0) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::{AnalyzerResponse, TokenUsage};
    use async_trait::async_trait;
    use sentinel_core::types::SecurityEvent;

    struct FixedAnalyzer {
        id: String,
        verdict: Option<AnalysisVerdict>,
    }

    #[async_trait]
    impl Analyzer for FixedAnalyzer {
        fn id(&self) -> &str {
            &self.id
        }

        async fn analyze(&self, _request: &AnalysisRequest) -> Result<AnalyzerResponse> {
            match &self.verdict {
                Some(verdict) => Ok(AnalyzerResponse {
                    verdict: verdict.clone(),
                    usage: TokenUsage::default(),
                }),
                None => Err(Error::new(ErrorCode::LlmProviderError, "down")),
            }
        }
    }

    fn verdict(risk: RiskLevel, confidence: u8) -> AnalysisVerdict {
        AnalysisVerdict {
            risk_level: risk,
            confidence,
            threat_classification: format!("class-{}", risk),
            mitre_techniques: vec![format!("T1-{}", confidence)],
            recommended_actions: vec!["investigate".into()],
            reasoning: "test".into(),
        }
    }

    fn member(id: &str, weight: f64, verdict_value: Option<AnalysisVerdict>) -> EnsembleMember {
        EnsembleMember {
            analyzer: Arc::new(FixedAnalyzer {
                id: id.into(),
                verdict: verdict_value,
            }),
            weight,
        }
    }

    fn request() -> AnalysisRequest {
        let record = sentinel_core::types::RawRecord {
            channel: "Security".into(),
            event_id: 4625,
            time_created: chrono::Utc::now(),
            xml_payload: "<Event/>".into(),
            host: "WIN-1".into(),
            bookmark_token: 1,
            fields: Default::default(),
        };
        AnalysisRequest::new(SecurityEvent::minimal(&record), Vec::new())
    }

    #[tokio::test]
    async fn weighted_voting_favors_heavy_model() {
        let ensemble = Ensemble::new(
            vec![
                member("a", 3.0, Some(verdict(RiskLevel::Critical, 90))),
                member("b", 1.0, Some(verdict(RiskLevel::Low, 40))),
                member("c", 1.0, Some(verdict(RiskLevel::Low, 45))),
            ],
            VotingStrategy::Weighted,
            ConfidenceAggregation::WeightedMean,
            2,
            true,
        );

        let result = ensemble.analyze(&request()).await.unwrap();
        assert_eq!(result.risk_level, RiskLevel::Critical);
    }

    #[tokio::test]
    async fn majority_tie_broken_by_weight() {
        let ensemble = Ensemble::new(
            vec![
                member("a", 1.0, Some(verdict(RiskLevel::High, 80))),
                member("b", 2.0, Some(verdict(RiskLevel::Medium, 70))),
            ],
            VotingStrategy::Majority,
            ConfidenceAggregation::Mean,
            2,
            true,
        );

        let result = ensemble.analyze(&request()).await.unwrap();
        assert_eq!(result.risk_level, RiskLevel::Medium);
    }

    #[tokio::test]
    async fn unanimous_disagreement_degrades() {
        let ensemble = Ensemble::new(
            vec![
                member("a", 1.0, Some(verdict(RiskLevel::High, 80))),
                member("b", 1.0, Some(verdict(RiskLevel::Low, 50))),
            ],
            VotingStrategy::Unanimous,
            ConfidenceAggregation::Mean,
            2,
            true,
        );

        let err = ensemble.analyze(&request()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::EnsembleQuorumShortfall);
    }

    #[tokio::test]
    async fn quorum_shortfall_uses_highest_weight_response() {
        let ensemble = Ensemble::new(
            vec![
                member("a", 1.0, None),
                member("b", 2.0, Some(verdict(RiskLevel::Medium, 60))),
                member("c", 5.0, None),
            ],
            VotingStrategy::Weighted,
            ConfidenceAggregation::Mean,
            2,
            true,
        );

        let result = ensemble.analyze(&request()).await.unwrap();
        assert_eq!(result.risk_level, RiskLevel::Medium);
        assert_eq!(result.confidence, 60);
    }

    #[tokio::test]
    async fn all_members_failing_is_quorum_shortfall() {
        let ensemble = Ensemble::new(
            vec![member("a", 1.0, None), member("b", 1.0, None)],
            VotingStrategy::Weighted,
            ConfidenceAggregation::Mean,
            2,
            true,
        );

        let err = ensemble.analyze(&request()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::EnsembleQuorumShortfall);
    }

    #[tokio::test]
    async fn confidence_aggregations() {
        for (aggregation, expected) in [
            (ConfidenceAggregation::Mean, 60),
            (ConfidenceAggregation::Median, 60),
            (ConfidenceAggregation::Min, 40),
            (ConfidenceAggregation::Max, 80),
        ] {
            let ensemble = Ensemble::new(
                vec![
                    member("a", 1.0, Some(verdict(RiskLevel::High, 40))),
                    member("b", 1.0, Some(verdict(RiskLevel::High, 60))),
                    member("c", 1.0, Some(verdict(RiskLevel::High, 80))),
                ],
                VotingStrategy::Weighted,
                aggregation,
                2,
                true,
            );
            let result = ensemble.analyze(&request()).await.unwrap();
            assert_eq!(result.confidence, expected, "{:?}", aggregation);
        }
    }

    #[tokio::test]
    async fn techniques_are_unioned() {
        let mut a = verdict(RiskLevel::High, 80);
        a.mitre_techniques = vec!["T1110.001".into()];
        let mut b = verdict(RiskLevel::High, 70);
        b.mitre_techniques = vec!["T1110.001".into(), "T1078".into()];

        let ensemble = Ensemble::new(
            vec![member("a", 1.0, Some(a)), member("b", 1.0, Some(b))],
            VotingStrategy::Weighted,
            ConfidenceAggregation::Mean,
            2,
            true,
        );

        let result = ensemble.analyze(&request()).await.unwrap();
        assert_eq!(result.mitre_techniques, vec!["T1110.001", "T1078"]);
    }
}
