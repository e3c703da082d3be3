use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::warn;

use paper_core::{LlmClient, LlmConfig, LlmError, LlmRequest};

/// Retries retryable server errors with exponential backoff.
///
/// Context overflows and fatal errors are returned immediately so the caller
/// can bump the model tier or give up.
pub struct RetryingClient {
    /// Wrapped client
    inner: Arc<dyn LlmClient>,
    /// Total attempts per request, including the first
    max_attempts: u32,
    /// Delay before the first retry
    initial_backoff: Duration,
}

impl RetryingClient {
    /// Wraps a client.
    pub fn new(inner: Arc<dyn LlmClient>, max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            inner,
            max_attempts: max_attempts.max(1),
            initial_backoff,
        }
    }

    /// Wraps a client with the attempt budget of the LLM configuration.
    pub fn from_config(inner: Arc<dyn LlmClient>, config: &LlmConfig) -> Self {
        Self::new(
            inner,
            config.max_attempts,
            Duration::from_millis(config.initial_backoff_ms),
        )
    }
}

#[async_trait]
impl LlmClient for RetryingClient {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn request(&self, request: &LlmRequest) -> Result<String, LlmError> {
        let mut backoff = self.initial_backoff;
        let mut attempt = 1;
        loop {
            match self.inner.request(request).await {
                Err(error) if error.is_retryable() && attempt < self.max_attempts => {
                    warn!(
                        "{} failed (attempt {attempt}/{}): {error}; retrying in {}ms",
                        self.inner.name(),
                        self.max_attempts,
                        backoff.as_millis()
                    );
                    sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::panic,
    clippy::assertions_on_result_states,
    reason = "Tests unwrap and assert on results directly"
)]
mod tests {
    use super::*;
    use crate::mock::ScriptedProvider;
    use paper_core::{LlmSettings, ModelEngine};

    fn request() -> LlmRequest {
        LlmRequest::new(Vec::new(), &LlmSettings::default())
    }

    /// Tests that server errors are retried until a response arrives.
    ///
    /// # Panics
    /// Panics if assertions fail during test execution.
    #[tokio::test]
    async fn test_retries_server_errors() {
        let provider = ScriptedProvider::new("flaky")
            .with_queued_error(LlmError::Server("503".to_owned()))
            .with_queued_error(LlmError::Server("503".to_owned()))
            .with_queued("ok");
        let client = RetryingClient::new(Arc::new(provider.clone()), 3, Duration::from_millis(1));

        let result = client.request(&request()).await;
        assert_eq!(result, Ok("ok".to_owned()));
        assert_eq!(provider.call_count(), 3);
    }

    /// Tests that the attempt budget bounds the retries.
    ///
    /// # Panics
    /// Panics if assertions fail during test execution.
    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let provider = ScriptedProvider::new("down")
            .with_queued_error(LlmError::Server("503".to_owned()))
            .with_queued_error(LlmError::Server("503".to_owned()))
            .with_queued("too late");
        let client = RetryingClient::new(Arc::new(provider.clone()), 2, Duration::from_millis(1));

        let result = client.request(&request()).await;
        assert!(matches!(result, Err(LlmError::Server(_))));
        assert_eq!(provider.call_count(), 2);
    }

    /// Tests that context overflows are not retried.
    ///
    /// # Panics
    /// Panics if assertions fail during test execution.
    #[tokio::test]
    async fn test_token_limit_is_not_retried() {
        let provider = ScriptedProvider::new("small").with_queued_error(LlmError::TokenLimit {
            engine: ModelEngine::Fast,
            message: "maximum context length".to_owned(),
        });
        let client = RetryingClient::new(Arc::new(provider.clone()), 5, Duration::from_millis(1));

        let result = client.request(&request()).await;
        assert!(matches!(result, Err(LlmError::TokenLimit { .. })));
        assert_eq!(provider.call_count(), 1);
    }
}
