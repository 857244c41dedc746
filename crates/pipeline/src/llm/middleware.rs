//! Analyzer middleware. Each layer wraps another [`Analyzer`] behind the
//! same contract, composed innermost-out: base provider → resilience
//! (retry, circuit breaker, timeout, one narrowed schema repair) → response
//! cache → telemetry.

use async_trait::async_trait;
use sentinel_core::cache::CacheService;
use sentinel_core::error::{Error, ErrorCode, Result};
use sentinel_core::metrics::PipelineMetrics;
use sentinel_core::pool::CircuitBreaker;
use sentinel_core::retry::{retry_transient, Backoff};
use sentinel_core::types::text_hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::provider::{Analyzer, AnalyzerResponse, TokenUsage};
use super::schema::AnalysisRequest;

/// Retry + circuit breaker + timeout + schema repair.
pub struct Resilient<A> {
    inner: A,
    breaker: CircuitBreaker,
    backoff: Backoff,
    timeout: Duration,
}

impl<A: Analyzer> Resilient<A> {
    pub fn new(
        inner: A,
        failure_threshold: u32,
        cool_off: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            inner,
            breaker: CircuitBreaker::new(failure_threshold, cool_off),
            backoff: Backoff::default(),
            timeout,
        }
    }

    async fn call_once(&self, request: &AnalysisRequest) -> Result<AnalyzerResponse> {
        match tokio::time::timeout(self.timeout, self.inner.analyze(request)).await {
            Ok(result) => result,
            Err(_) => Err(Error::new(
                ErrorCode::StageTimeout,
                format!("model '{}' timed out", self.inner.id()),
            )),
        }
    }
}

#[async_trait]
impl<A: Analyzer> Analyzer for Resilient<A> {
    fn id(&self) -> &str {
        self.inner.id()
    }

    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalyzerResponse> {
        if !self.breaker.try_acquire() {
            return Err(Error::new(
                ErrorCode::CircuitOpen,
                format!("circuit open for model '{}'", self.inner.id()),
            ));
        }

        let result = retry_transient(&self.backoff, || self.call_once(request)).await;

        // One repair attempt with a narrowed prompt on schema violations.
        let result = match result {
            Err(e) if e.code == ErrorCode::LlmSchemaViolation && !request.narrowed => {
                debug!(model = self.inner.id(), "schema violation, retrying narrowed");
                let narrowed = request.clone().narrowed();
                self.call_once(&narrowed).await
            }
            other => other,
        };

        match &result {
            Ok(_) => self.breaker.record_success(),
            // Schema violations degrade, they do not trip the breaker.
            Err(e) if e.code == ErrorCode::LlmSchemaViolation => self.breaker.record_success(),
            Err(_) => self.breaker.record_failure(),
        }
        result
    }
}

/// Response cache keyed by `hash(prompt | model_id)`. High-confidence
/// verdicts get an extended TTL, low-confidence a shortened one.
pub struct Cached<A> {
    inner: A,
    cache: Arc<CacheService>,
}

impl<A: Analyzer> Cached<A> {
    pub fn new(inner: A, cache: Arc<CacheService>) -> Self {
        Self { inner, cache }
    }

    fn cache_key(&self, request: &AnalysisRequest) -> String {
        text_hash(&format!("{}|{}", request.prompt(), self.inner.id()))
    }

    fn ttl_for_confidence(confidence: u8) -> Duration {
        match confidence {
            80..=100 => Duration::from_secs(60 * 60),
            30..=79 => Duration::from_secs(30 * 60),
            _ => Duration::from_secs(10 * 60),
        }
    }
}

#[async_trait]
impl<A: Analyzer> Analyzer for Cached<A> {
    fn id(&self) -> &str {
        self.inner.id()
    }

    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalyzerResponse> {
        let key = self.cache_key(request);

        if let Some(cached) = self.cache.llm_response.get(&key) {
            if let Ok(verdict) = serde_json::from_value(cached) {
                return Ok(AnalyzerResponse {
                    verdict,
                    usage: TokenUsage::default(),
                });
            }
        }

        let response = self.inner.analyze(request).await?;
        let ttl = Self::ttl_for_confidence(response.verdict.confidence);
        self.cache
            .llm_response
            .put_with_ttl(key, serde_json::to_value(&response.verdict)?, ttl);
        Ok(response)
    }
}

/// Latency/outcome/token accounting.
pub struct Telemetry<A> {
    inner: A,
    metrics: PipelineMetrics,
}

impl<A: Analyzer> Telemetry<A> {
    pub fn new(inner: A, metrics: PipelineMetrics) -> Self {
        Self { inner, metrics }
    }
}

#[async_trait]
impl<A: Analyzer> Analyzer for Telemetry<A> {
    fn id(&self) -> &str {
        self.inner.id()
    }

    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalyzerResponse> {
        let started = Instant::now();
        let result = self.inner.analyze(request).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;

        self.metrics.llm_latency_ms.observe(elapsed_ms);
        let outcome = match &result {
            Ok(_) => "success",
            Err(e) if e.code == ErrorCode::LlmSchemaViolation => "schema_violation",
            Err(e) if e.code == ErrorCode::CircuitOpen => "circuit_open",
            Err(_) => "error",
        };
        self.metrics
            .llm_requests
            .with_label_values(&[self.inner.id(), outcome])
            .inc();
        if let Ok(response) = &result {
            self.metrics
                .llm_tokens
                .inc_by(response.usage.prompt_tokens + response.usage.completion_tokens);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::config::CacheConfig;
    use sentinel_core::types::{RiskLevel, SecurityEvent};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedAnalyzer {
        calls: AtomicU32,
        fail_first: u32,
        failure_code: ErrorCode,
    }

    impl ScriptedAnalyzer {
        fn verdict() -> super::super::schema::AnalysisVerdict {
            super::super::schema::AnalysisVerdict {
                risk_level: RiskLevel::High,
                confidence: 90,
                threat_classification: "credential_access".into(),
                mitre_techniques: vec!["T1110.001".into()],
                recommended_actions: vec!["Block source".into()],
                reasoning: "scripted".into(),
            }
        }
    }

    #[async_trait]
    impl Analyzer for ScriptedAnalyzer {
        fn id(&self) -> &str {
            "scripted"
        }

        async fn analyze(&self, _request: &AnalysisRequest) -> Result<AnalyzerResponse> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                Err(Error::new(self.failure_code, "scripted failure"))
            } else {
                Ok(AnalyzerResponse {
                    verdict: Self::verdict(),
                    usage: TokenUsage::default(),
                })
            }
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
    async fn resilient_retries_transient_failures() {
        let analyzer = Resilient::new(
            ScriptedAnalyzer {
                calls: AtomicU32::new(0),
                fail_first: 2,
                failure_code: ErrorCode::LlmProviderError,
            },
            5,
            Duration::from_secs(60),
            Duration::from_secs(5),
        );

        let response = analyzer.analyze(&request()).await.unwrap();
        assert_eq!(response.verdict.risk_level, RiskLevel::High);
    }

    #[tokio::test]
    async fn schema_violation_gets_one_narrowed_repair() {
        let analyzer = Resilient::new(
            ScriptedAnalyzer {
                calls: AtomicU32::new(0),
                fail_first: 1,
                failure_code: ErrorCode::LlmSchemaViolation,
            },
            5,
            Duration::from_secs(60),
            Duration::from_secs(5),
        );

        let response = analyzer.analyze(&request()).await.unwrap();
        assert_eq!(response.verdict.confidence, 90);
    }

    #[tokio::test]
    async fn breaker_opens_after_consecutive_failures() {
        let analyzer = Resilient::new(
            ScriptedAnalyzer {
                calls: AtomicU32::new(0),
                fail_first: u32::MAX,
                failure_code: ErrorCode::MalformedRecord, // non-transient: no internal retries
            },
            2,
            Duration::from_secs(60),
            Duration::from_secs(5),
        );

        let req = request();
        assert!(analyzer.analyze(&req).await.is_err());
        assert!(analyzer.analyze(&req).await.is_err());
        let err = analyzer.analyze(&req).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::CircuitOpen);
    }

    #[tokio::test]
    async fn cached_layer_serves_second_call_without_inner() {
        let cache = Arc::new(CacheService::new(&CacheConfig::default()));
        let analyzer = Cached::new(
            ScriptedAnalyzer {
                calls: AtomicU32::new(0),
                fail_first: 0,
                failure_code: ErrorCode::LlmProviderError,
            },
            Arc::clone(&cache),
        );

        let req = request();
        analyzer.analyze(&req).await.unwrap();
        analyzer.analyze(&req).await.unwrap();
        assert_eq!(analyzer.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn confidence_scales_cache_ttl() {
        type C = Cached<ScriptedAnalyzer>;
        assert_eq!(C::ttl_for_confidence(95), Duration::from_secs(3_600));
        assert_eq!(C::ttl_for_confidence(50), Duration::from_secs(1_800));
        assert_eq!(C::ttl_for_confidence(10), Duration::from_secs(600));
    }
}
