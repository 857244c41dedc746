//! Base analyzer contract and the chat-completions provider.

use async_trait::async_trait;
use sentinel_core::config::LlmModelConfig;
use sentinel_core::error::{Error, ErrorCode, Result};
use serde::Deserialize;
use std::time::Duration;

use super::schema::{parse_verdict, AnalysisRequest, AnalysisVerdict};

/// Token usage reported by a provider, when available.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Output of one analyzer call.
#[derive(Debug, Clone)]
pub struct AnalyzerResponse {
    pub verdict: AnalysisVerdict,
    pub usage: TokenUsage,
}

/// The single contract every layer of the analyzer chain implements, so
/// retry, caching and telemetry compose as plain wrappers.
#[async_trait]
pub trait Analyzer: Send + Sync + 'static {
    fn id(&self) -> &str;
    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalyzerResponse>;
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// OpenAI-compatible chat-completions provider.
pub struct ChatProvider {
    config: LlmModelConfig,
    client: reqwest::Client,
}

impl ChatProvider {
    pub fn new(config: LlmModelConfig, request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_default();
        Self { config, client }
    }
}

#[async_trait]
impl Analyzer for ChatProvider {
    fn id(&self) -> &str {
        &self.config.id
    }

    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalyzerResponse> {
        let mut http = self.client.post(&self.config.endpoint).json(&serde_json::json!({
            "model": self.config.id,
            "messages": [
                { "role": "user", "content": request.prompt() }
            ],
            "temperature": 0.1,
        }));
        if let Some(api_key) = &self.config.api_key {
            http = http.bearer_auth(api_key);
        }

        let response = http.send().await.map_err(provider_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::new(
                match status.as_u16() {
                    429 => ErrorCode::RateLimited,
                    s if s >= 500 => ErrorCode::LlmProviderError,
                    _ => ErrorCode::InvalidInput,
                },
                format!("model '{}' returned {}", self.config.id, status),
            ));
        }

        let body: ChatCompletionResponse = response.json().await.map_err(provider_error)?;
        let content = body
            .choices
            .first()
            .map(|choice| choice.message.content.as_str())
            .ok_or_else(|| {
                Error::new(ErrorCode::LlmProviderError, "empty completion response")
            })?;

        let verdict = parse_verdict(content)?;
        let usage = body
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        Ok(AnalyzerResponse { verdict, usage })
    }
}

fn provider_error(err: reqwest::Error) -> Error {
    let code = if err.is_timeout() {
        ErrorCode::NetworkTimeout
    } else {
        ErrorCode::LlmProviderError
    };
    Error::new(code, err.to_string()).add_trace("chat provider call")
}
