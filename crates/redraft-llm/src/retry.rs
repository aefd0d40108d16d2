use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{info, warn};

use redraft_core::config::RetryConfig;
use redraft_core::error::{RedraftError, Result};
use redraft_core::traits::GenerationService;

/// A generation client that retries transient failures and falls back to
/// alternative models once the primary is exhausted.
pub struct RetryingClient {
    primary: Box<dyn GenerationService>,
    fallbacks: Vec<(String, Box<dyn GenerationService>)>,
    retry_config: RetryConfig,
}

impl RetryingClient {
    pub fn new(
        primary: Box<dyn GenerationService>,
        fallbacks: Vec<(String, Box<dyn GenerationService>)>,
        retry_config: RetryConfig,
    ) -> Self {
        Self {
            primary,
            fallbacks,
            retry_config,
        }
    }

    async fn call<'a, T, F>(&'a self, call: F) -> Result<T>
    where
        F: Fn(&'a dyn GenerationService) -> BoxFuture<'a, Result<T>>,
    {
        let max_retries = self.retry_config.max_retries;

        let mut last_err = None;
        for attempt in 0..=max_retries {
            match call(self.primary.as_ref()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if is_retryable(&e) && attempt < max_retries {
                        let backoff = calculate_backoff(attempt, &self.retry_config);
                        warn!(
                            attempt = attempt + 1,
                            max_retries,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "Retrying generation request"
                        );
                        tokio::time::sleep(backoff).await;
                        last_err = Some(e);
                        continue;
                    }
                    last_err = Some(e);
                    break;
                }
            }
        }

        if !self.fallbacks.is_empty() {
            info!("Primary model exhausted, trying fallback models");
        }
        for (model_id, client) in &self.fallbacks {
            match call(client.as_ref()).await {
                Ok(value) => {
                    info!(model = %model_id, "Fell back to alternative model");
                    return Ok(value);
                }
                Err(e) => {
                    warn!(model = %model_id, error = %e, "Fallback model also failed");
                }
            }
        }

        Err(last_err.unwrap_or_else(|| RedraftError::LlmRequest("All providers failed".into())))
    }
}

fn is_retryable(e: &RedraftError) -> bool {
    match e {
        RedraftError::LlmRequest(msg) => {
            msg.contains("429")
                || msg.contains("500")
                || msg.contains("502")
                || msg.contains("503")
                || msg.contains("timeout")
                || msg.contains("connection")
        }
        RedraftError::LlmStream(_) => true,
        _ => false,
    }
}

fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // Jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

impl GenerationService for RetryingClient {
    fn invoke<'a>(&'a self, system: &'a str, user: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(self.call(move |client| client.invoke(system, user)))
    }

    fn invoke_structured<'a>(
        &'a self,
        system: &'a str,
        user: &'a str,
        schema: &'a serde_json::Value,
    ) -> BoxFuture<'a, Result<serde_json::Value>> {
        Box::pin(self.call(move |client| client.invoke_structured(system, user, schema)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Fails the first `failures` calls with `error`, then answers `reply`.
    struct Flaky {
        failures: usize,
        error: fn() -> RedraftError,
        reply: &'static str,
        calls: Arc<AtomicUsize>,
    }

    impl GenerationService for Flaky {
        fn invoke<'a>(&'a self, _system: &'a str, _user: &'a str) -> BoxFuture<'a, Result<String>> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst);
                if n < self.failures {
                    Err((self.error)())
                } else {
                    Ok(self.reply.to_string())
                }
            })
        }

        fn invoke_structured<'a>(
            &'a self,
            system: &'a str,
            user: &'a str,
            _schema: &'a serde_json::Value,
        ) -> BoxFuture<'a, Result<serde_json::Value>> {
            Box::pin(async move {
                let text = self.invoke(system, user).await?;
                Ok(serde_json::json!({ "queries": [text] }))
            })
        }
    }

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    fn flaky(
        failures: usize,
        error: fn() -> RedraftError,
        reply: &'static str,
    ) -> (Box<dyn GenerationService>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let client = Flaky {
            failures,
            error,
            reply,
            calls: calls.clone(),
        };
        (Box::new(client), calls)
    }

    fn http_503() -> RedraftError {
        RedraftError::LlmRequest("HTTP 503 Service Unavailable: busy".into())
    }

    fn http_401() -> RedraftError {
        RedraftError::LlmRequest("HTTP 401 Unauthorized: bad key".into())
    }

    #[test]
    fn test_is_retryable() {
        assert!(is_retryable(&http_503()));
        assert!(is_retryable(&RedraftError::LlmStream("reset".into())));
        assert!(!is_retryable(&http_401()));
        assert!(!is_retryable(&RedraftError::SchemaViolation("x".into())));
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = RetryConfig {
            max_retries: 10,
            initial_backoff_ms: 1000,
            max_backoff_ms: 5000,
        };
        let d = calculate_backoff(8, &config);
        assert!(d.as_millis() <= 6000);
        assert!(d.as_millis() >= 4000);
    }

    #[tokio::test]
    async fn test_retries_transient_failure() {
        let (primary, calls) = flaky(2, http_503, "ok");
        let client = RetryingClient::new(primary, vec![], fast_retry(3));
        assert_eq!(client.invoke("s", "u").await.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_falls_back_immediately() {
        let (primary, primary_calls) = flaky(usize::MAX, http_401, "never");
        let (fallback, fallback_calls) = flaky(0, http_503, "from fallback");
        let client = RetryingClient::new(
            primary,
            vec![("backup-model".to_string(), fallback)],
            fast_retry(3),
        );

        let value = client
            .invoke_structured("s", "u", &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(value["queries"][0], "from fallback");
        assert_eq!(primary_calls.load(Ordering::SeqCst), 1);
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_all_providers_fail_returns_primary_error() {
        let (primary, _) = flaky(usize::MAX, http_503, "never");
        let (fallback, _) = flaky(usize::MAX, http_401, "never");
        let client =
            RetryingClient::new(primary, vec![("backup".to_string(), fallback)], fast_retry(1));
        let err = client.invoke("s", "u").await.unwrap_err();
        assert!(err.to_string().contains("503"));
    }
}
