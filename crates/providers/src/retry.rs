//! Transient-failure retry for any provider.
//!
//! Rate limits, timeouts, dropped connections and 5xx responses are retried
//! with capped exponential backoff when opening a stream. Anything else (bad
//! key, unknown model, context overflow) is returned immediately so the
//! caller can act on it.

use async_trait::async_trait;
use std::sync::Arc;
use toolweave_core::error::ProviderError;
use toolweave_core::provider::*;
use toolweave_core::Backoff;
use tracing::{info, warn};

/// A provider that retries transient failures of its inner provider.
pub struct RetryingProvider {
    inner: Arc<dyn toolweave_core::Provider>,
    backoff: Backoff,
}

impl RetryingProvider {
    pub fn new(inner: Arc<dyn toolweave_core::Provider>, backoff: Backoff) -> Self {
        Self { inner, backoff }
    }

    pub fn from_config(
        inner: Arc<dyn toolweave_core::Provider>,
        config: &toolweave_config::ProviderRetryConfig,
    ) -> Self {
        Self::new(
            inner,
            Backoff::new(config.max_retries, config.base_delay_ms, config.max_delay_ms),
        )
    }
}

#[async_trait]
impl toolweave_core::Provider for RetryingProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn stream_completion(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<DeltaStream, ProviderError> {
        let mut retry = 0;
        loop {
            match self.inner.stream_completion(request.clone()).await {
                Ok(rx) => {
                    if retry > 0 {
                        info!(provider = %self.inner.name(), retry, "Provider recovered after retry");
                    }
                    return Ok(rx);
                }
                Err(e) if e.is_transient() && retry < self.backoff.max_retries => {
                    retry += 1;
                    let mut delay = self.backoff.delay_for(retry);
                    if let ProviderError::RateLimited { retry_after_secs } = e {
                        delay = delay
                            .max(std::time::Duration::from_secs(retry_after_secs))
                            .min(self.backoff.max_delay);
                    }
                    warn!(
                        provider = %self.inner.name(),
                        error = %e,
                        retry,
                        max_retries = self.backoff.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Transient provider failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn embed(
        &self,
        request: EmbeddingRequest,
    ) -> std::result::Result<EmbeddingResponse, ProviderError> {
        let mut retry = 0;
        loop {
            match self.inner.embed(request.clone()).await {
                Err(e) if e.is_transient() && retry < self.backoff.max_retries => {
                    retry += 1;
                    let delay = self.backoff.delay_for(retry);
                    warn!(provider = %self.inner.name(), error = %e, retry, "Embedding failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    async fn health_check(&self) -> std::result::Result<bool, ProviderError> {
        self.inner.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;
    use toolweave_core::message::Message;
    use toolweave_core::Provider;

    /// Fails with the queued errors, then streams "ok".
    struct FlakyProvider {
        errors: Mutex<VecDeque<ProviderError>>,
        call_count: Mutex<usize>,
    }

    impl FlakyProvider {
        fn new(errors: Vec<ProviderError>) -> Self {
            Self {
                errors: Mutex::new(errors.into()),
                call_count: Mutex::new(0),
            }
        }

        fn calls(&self) -> usize {
            *self.call_count.lock().unwrap()
        }
    }

    #[async_trait]
    impl Provider for FlakyProvider {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn stream_completion(
            &self,
            _request: ProviderRequest,
        ) -> std::result::Result<DeltaStream, ProviderError> {
            *self.call_count.lock().unwrap() += 1;
            if let Some(e) = self.errors.lock().unwrap().pop_front() {
                return Err(e);
            }
            let (tx, rx) = tokio::sync::mpsc::channel(4);
            tx.send(Ok(StreamDelta::Text { text: "ok".into() }))
                .await
                .unwrap();
            tx.send(Ok(StreamDelta::Done {
                finish_reason: Some("stop".into()),
            }))
            .await
            .unwrap();
            Ok(rx)
        }
    }

    fn request() -> ProviderRequest {
        ProviderRequest::new("test", vec![Message::user("hello")])
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_then_succeeds() {
        let inner = Arc::new(FlakyProvider::new(vec![
            ProviderError::Network("reset".into()),
            ProviderError::ApiError {
                status_code: 503,
                message: "overloaded".into(),
            },
        ]));
        let provider = RetryingProvider::new(inner.clone(), Backoff::new(3, 1000, 8000));

        let started = tokio::time::Instant::now();
        let resp = provider.complete(request()).await.unwrap();
        assert_eq!(resp.message.content, "ok");
        assert_eq!(inner.calls(), 3);
        // 1s + 2s of backoff
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let inner = Arc::new(FlakyProvider::new(vec![
            ProviderError::Timeout("slow".into()),
            ProviderError::Timeout("slow".into()),
            ProviderError::Timeout("slow".into()),
        ]));
        let provider = RetryingProvider::new(inner.clone(), Backoff::new(2, 100, 1000));

        let err = provider.complete(request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Timeout(_)));
        assert_eq!(inner.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let inner = Arc::new(FlakyProvider::new(vec![ProviderError::AuthenticationFailed(
            "bad key".into(),
        )]));
        let provider = RetryingProvider::new(inner.clone(), Backoff::default());

        let err = provider.complete(request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::AuthenticationFailed(_)));
        assert_eq!(inner.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn context_overflow_passes_through() {
        let inner = Arc::new(FlakyProvider::new(vec![ProviderError::ContextLengthExceeded(
            "too long".into(),
        )]));
        let provider = RetryingProvider::new(inner.clone(), Backoff::default());

        let err = provider.complete(request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::ContextLengthExceeded(_)));
        assert_eq!(inner.calls(), 1);
        assert_eq!(provider.name(), "flaky");
    }
}
