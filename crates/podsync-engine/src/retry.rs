//! Exponential backoff for transient failures
//!
//! Only [`ScanError::TransientNetwork`] is retried. Quota exhaustion,
//! cancellation, expired credentials and invalid requests surface on the
//! first attempt so the walker can decide what to do with them.
//!
//! Backoff schedule with the default policy: ~1s, ~2s, capped at 30s, each
//! with up to 1s of uniform jitter. A cancel during a backoff sleep ends it
//! at once with [`ScanError::Cancelled`].

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{info, warn};

use podsync_core::config::RetryConfig;
use podsync_core::domain::ScanError;

use crate::control::RunCancellation;

/// Attempt count and delay bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            max_jitter: Duration::from_millis(1000),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_jitter: Duration::from_millis(config.max_jitter_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let backoff = self.base_delay.saturating_mul(1u32 << exponent);
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        (backoff + jitter).min(self.max_delay)
    }
}

/// Runs operations under a [`RetryPolicy`]
#[derive(Debug, Clone, Default)]
pub struct BackoffRetrier {
    policy: RetryPolicy,
    cancel: RunCancellation,
}

impl BackoffRetrier {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            cancel: RunCancellation::new(),
        }
    }

    /// Ties backoff sleeps to the given cancellation source
    pub fn with_cancellation(mut self, cancel: RunCancellation) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Executes `op`, repeating it while it fails with a retryable error
    ///
    /// # Errors
    /// Returns the first non-retryable error, or the last error once
    /// `max_attempts` is reached.
    pub async fn retry<T, F, Fut>(&self, operation_name: &str, op: F) -> Result<T, ScanError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ScanError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(
                            operation = operation_name,
                            attempt, "Operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        operation = operation_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient error, retrying"
                    );
                    let cancel = self.cancel.token();
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            info!(operation = operation_name, attempt, "Backoff interrupted by cancellation");
                            return Err(ScanError::Cancelled);
                        }
                    }
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_retryable() {
                        warn!(
                            operation = operation_name,
                            attempts = attempt,
                            error = %err,
                            "Retries exhausted"
                        );
                    }
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use chrono::Utc;
    use podsync_core::domain::QuotaCategory;

    use super::*;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            max_jitter: Duration::ZERO,
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_jitter: Duration::ZERO,
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(6), Duration::from_secs(30));
        assert_eq!(policy.delay_for(40), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for attempt in 1..8 {
            let delay = policy.delay_for(attempt);
            assert!(delay <= policy.max_delay);
            let floor = policy
                .base_delay
                .saturating_mul(1u32 << (attempt - 1))
                .min(policy.max_delay);
            assert!(delay >= floor);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_until_success() {
        let retrier = BackoffRetrier::new(fast_policy());
        let calls = AtomicU32::new(0);
        let value = retrier
            .retry("list_apps", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ScanError::TransientNetwork("connection reset".into()))
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let retrier = BackoffRetrier::new(fast_policy());
        let calls = AtomicU32::new(0);
        let err = retrier
            .retry("count_items", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ScanError::TransientNetwork("timeout".into()))
            })
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_retries_non_transient_errors() {
        let retrier = BackoffRetrier::new(fast_policy());
        let errors = [
            ScanError::QuotaExhausted {
                category: QuotaCategory::Lightweight,
                resume_at: Utc::now(),
            },
            ScanError::Cancelled,
            ScanError::AuthExpired("expired".into()),
            ScanError::InvalidRequest {
                code: Some("invalid_value".into()),
                message: "bad limit".into(),
            },
        ];
        for error in errors {
            let calls = AtomicU32::new(0);
            let returned = retrier
                .retry("op", || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let error = error.clone();
                    async move { Err::<(), _>(error) }
                })
                .await
                .unwrap_err();
            assert_eq!(returned, error);
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let cancel = RunCancellation::new();
        let retrier = BackoffRetrier::new(RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
            max_jitter: Duration::ZERO,
        })
        .with_cancellation(cancel.clone());

        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let run = retrier.retry("list_files", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ScanError::TransientNetwork("reset".into()))
        });
        let cancel_soon = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        };
        let (result, ()) = tokio::join!(run, cancel_soon);

        assert_eq!(result, Err(ScanError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[test]
    fn test_policy_from_config() {
        let policy = RetryPolicy::from(&RetryConfig::default());
        assert_eq!(policy, RetryPolicy::default());
    }
}
