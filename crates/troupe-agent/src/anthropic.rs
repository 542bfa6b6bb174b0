//! Anthropic Messages API adapter for [`LlmClient`]
//!
//! Retries 429 and 5xx responses with exponential backoff (honoring
//! `retry-after`), and trips the client's circuit breaker on non-retryable
//! failures. Rate limiting is not done here; wrap the client in
//! [`crate::RateLimitedClient`].

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use troupe_core::{Result, TroupeError};

use crate::auth;
use crate::circuit_breaker::CircuitBreaker;
use crate::llm::LlmClient;
use crate::types::{AnthropicRequest, AnthropicResponse, CompletionRequest, CompletionResponse};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

// Retry configuration
const MAX_RETRIES: u32 = 5;
const INITIAL_BACKOFF_SECS: u64 = 30;
const MAX_BACKOFF_SECS: u64 = 300;

/// HTTP client for the Anthropic Messages API
pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    breaker: CircuitBreaker,
}

impl AnthropicClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: ANTHROPIC_API_URL.to_string(),
            breaker: CircuitBreaker::default(),
        }
    }

    /// Build a client from the standard credential environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(auth::resolve_api_key(auth::ANTHROPIC_KEY_VARS)?))
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn backoff(wait: Duration, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => Err(TroupeError::Canceled),
            _ = tokio::time::sleep(wait) => Ok(()),
        }
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn complete(
        &self,
        request: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse> {
        self.breaker.check()?;

        let body = AnthropicRequest {
            model: &request.model,
            max_tokens: request.max_tokens,
            system: request.system.as_deref(),
            messages: &request.messages,
            tools: (!request.tools.is_empty()).then_some(request.tools.as_slice()),
        };

        let mut retries = 0;
        let mut backoff_secs = INITIAL_BACKOFF_SECS;

        loop {
            tracing::debug!("Sending request to Anthropic API (attempt {})", retries + 1);

            let send = self
                .http
                .post(&self.base_url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("content-type", "application/json")
                .json(&body)
                .send();

            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TroupeError::Canceled),
                response = send => response
                    .map_err(|e| TroupeError::Llm(format!("Failed to send request: {}", e)))?,
            };
            let status = response.status();

            if status.as_u16() == 429 {
                retries += 1;
                if retries > MAX_RETRIES {
                    let error_text = response.text().await.unwrap_or_default();
                    return Err(TroupeError::ApiLimit(format!(
                        "Rate limited after {} retries: {}",
                        MAX_RETRIES, error_text
                    )));
                }

                let wait_secs = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(backoff_secs);

                tracing::warn!(
                    "Rate limited (429). Waiting {}s before retry {}/{}",
                    wait_secs,
                    retries,
                    MAX_RETRIES
                );
                Self::backoff(Duration::from_secs(wait_secs), cancel).await?;
                backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                continue;
            }

            if !status.is_success() {
                let error_text = response.text().await.unwrap_or_default();

                if status.is_server_error() && retries < MAX_RETRIES {
                    retries += 1;
                    tracing::warn!(
                        "Server error ({}). Waiting {}s before retry {}/{}",
                        status,
                        backoff_secs,
                        retries,
                        MAX_RETRIES
                    );
                    Self::backoff(Duration::from_secs(backoff_secs), cancel).await?;
                    backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                    continue;
                }

                self.breaker.record_failure();
                tracing::error!(
                    "Anthropic call failed, breaker failures: {}",
                    self.breaker.failure_count()
                );
                return Err(TroupeError::Llm(format!(
                    "Anthropic API error {}: {}",
                    status, error_text
                )));
            }

            let parsed: AnthropicResponse = response
                .json()
                .await
                .map_err(|e| TroupeError::Llm(format!("Failed to parse response: {}", e)))?;

            self.breaker.record_success();
            let completion = CompletionResponse::from(parsed);
            tracing::info!(
                "{} completion: {} chars, {} tool calls, {} tokens",
                request.model,
                completion.text.len(),
                completion.tool_calls.len(),
                completion.usage.total()
            );
            return Ok(completion);
        }
    }
}
