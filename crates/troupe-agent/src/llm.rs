//! LLM completion seam and its rate-limited wrapper

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use troupe_core::Result;

use crate::rate_limiter::RateLimiter;
use crate::types::{CompletionRequest, CompletionResponse};

/// Anything that can turn a completion request into a response
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        request: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse>;
}

/// Client wrapper that acquires a rate-limit permit around every call
///
/// The permit is sized from [`CompletionRequest::estimated_tokens`] and the
/// actual usage reported by the inner client is recorded against it.
#[derive(Clone)]
pub struct RateLimitedClient {
    inner: Arc<dyn LlmClient>,
    limiter: Arc<RateLimiter>,
}

impl RateLimitedClient {
    pub fn new(inner: Arc<dyn LlmClient>, limiter: Arc<RateLimiter>) -> Self {
        Self { inner, limiter }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }
}

#[async_trait]
impl LlmClient for RateLimitedClient {
    async fn complete(
        &self,
        request: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse> {
        let permit = self
            .limiter
            .acquire(&request.model, request.estimated_tokens(), cancel)
            .await?;

        let response = self.inner.complete(request, cancel).await?;
        permit.record_usage(response.usage.total());
        debug!(
            "{}: call used {} tokens (reserved {})",
            permit.model(),
            response.usage.total(),
            permit.reserved_tokens()
        );
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Usage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use troupe_core::{ModelLimits, TroupeError};

    struct CountingClient {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmClient for CountingClient {
        async fn complete(
            &self,
            _request: CompletionRequest,
            _cancel: &CancellationToken,
        ) -> Result<CompletionResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(CompletionResponse::text("ok").with_usage(Usage {
                input_tokens: 600,
                output_tokens: 400,
            }))
        }
    }

    #[tokio::test]
    async fn test_usage_recorded_and_budget_enforced() {
        let limiter = Arc::new(RateLimiter::new(vec![
            ModelLimits::new("m", 1_000_000, 0.5, 2).with_price(0.25),
        ]));
        let inner = Arc::new(CountingClient {
            calls: AtomicUsize::new(0),
        });
        let client = RateLimitedClient::new(inner.clone(), Arc::clone(&limiter));
        let cancel = CancellationToken::new();

        for _ in 0..2 {
            let request = CompletionRequest::new("m", "hi").with_max_tokens(10);
            client.complete(request, &cancel).await.unwrap();
        }

        let third = client
            .complete(CompletionRequest::new("m", "hi").with_max_tokens(10), &cancel)
            .await;
        assert!(matches!(third, Err(TroupeError::DailyBudgetExceeded { .. })));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
        limiter.close();
    }
}
