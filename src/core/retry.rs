//! Bounded retries with exponential backoff.

use crate::utils::error::{MonitorError, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Option<Duration>,
    /// Upper bound for a single attempt. Exceeding it counts as a retryable
    /// [`MonitorError::Timeout`].
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Some(Duration::from_secs(30)),
            attempt_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `n` (1-indexed): `base_delay * 2^(n-1)`, capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        let delay = self.base_delay.checked_mul(factor).unwrap_or(Duration::MAX);
        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}

pub struct RetryExecutor {
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Retries with the default predicate, [`MonitorError::is_retryable`].
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with(operation, MonitorError::is_retryable).await
    }

    /// Runs `operation` up to `max_retries + 1` times. The attempt number
    /// (starting at 1) is passed in. Only the last error is returned.
    pub async fn execute_with<T, F, Fut, P>(&self, mut operation: F, is_retryable: P) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&MonitorError) -> bool,
    {
        if self.cancel.is_cancelled() {
            return Err(MonitorError::Cancelled);
        }

        let total_attempts = self.policy.max_retries.saturating_add(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let outcome = match self.policy.attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, operation(attempt)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(MonitorError::Timeout { after: limit }),
                },
                None => operation(attempt).await,
            };

            let error = match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!("Succeeded on attempt {}/{}", attempt, total_attempts);
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if attempt >= total_attempts || !is_retryable(&error) {
                return Err(error);
            }

            let delay = self.policy.delay_for(attempt);
            tracing::warn!(
                "Attempt {}/{} failed: {} (retrying in {:?})",
                attempt,
                total_attempts,
                error,
                delay
            );

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::debug!("Retry cancelled after attempt {}", attempt);
                    return Err(error);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(100),
            max_delay: None,
            attempt_timeout: None,
        }
    }

    fn server_error(attempt: u32) -> MonitorError {
        MonitorError::HttpStatus {
            status: 503,
            url: format!("https://shop.example.com/{}", attempt),
        }
    }

    #[test]
    fn test_delay_doubles_per_retry() {
        let policy = policy(5);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy {
            max_delay: Some(Duration::from_millis(250)),
            ..policy(5)
        };
        assert_eq!(policy.delay_for(3), Duration::from_millis(250));
        assert_eq!(policy.delay_for(40), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_error_makes_max_retries_plus_one_attempts() {
        let executor = RetryExecutor::new(policy(3));
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let result: Result<()> = executor
            .execute(|attempt| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Err(server_error(attempt)) }
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        match result {
            Err(MonitorError::HttpStatus { url, .. }) => {
                assert_eq!(url, "https://shop.example.com/4")
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_makes_one_attempt() {
        let executor = RetryExecutor::new(policy(3));
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let result: Result<()> = executor
            .execute(|_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(MonitorError::HttpStatus {
                        status: 404,
                        url: "https://shop.example.com/gone".to_string(),
                    })
                }
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let executor = RetryExecutor::new(policy(3));
        let started = tokio::time::Instant::now();

        let value = executor
            .execute(|attempt| async move {
                if attempt < 3 {
                    Err(server_error(attempt))
                } else {
                    Ok(attempt)
                }
            })
            .await;

        assert_eq!(value.unwrap(), 3);
        // 100ms + 200ms of backoff
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_predicate_overrides_default() {
        let executor = RetryExecutor::new(policy(2));
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let result: Result<()> = executor
            .execute_with(
                |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async {
                        Err(MonitorError::NotificationError {
                            message: "flaky".to_string(),
                        })
                    }
                },
                |_| true,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_retried() {
        let executor = RetryExecutor::new(RetryPolicy {
            attempt_timeout: Some(Duration::from_secs(1)),
            ..policy(1)
        });

        let result = executor
            .execute(|attempt| async move {
                if attempt == 1 {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Ok(attempt)
            })
            .await;

        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_start_makes_no_attempt() {
        let token = CancellationToken::new();
        token.cancel();
        let executor = RetryExecutor::new(policy(3)).with_cancellation(token);
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let result: Result<()> = executor
            .execute(|_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert!(matches!(result, Err(MonitorError::Cancelled)));
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_stops_retrying() {
        let token = CancellationToken::new();
        let executor = RetryExecutor::new(RetryPolicy {
            base_delay: Duration::from_secs(10),
            ..policy(3)
        })
        .with_cancellation(token.clone());
        let attempts = Arc::new(AtomicU32::new(0));

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });

        let counter = attempts.clone();
        let result: Result<()> = executor
            .execute(|attempt| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Err(server_error(attempt)) }
            })
            .await;
        canceller.await.unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(MonitorError::HttpStatus { status: 503, .. })));
    }
}
