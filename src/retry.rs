//! Retry policy for calls to external services
//!
//! Every client that talks to a remote service (transcription, dialogue
//! model, synthesis) is handed a [`RetryPolicy`] instead of hardcoding its own
//! attempt loop. The policy bounds each attempt with a timeout and retries
//! only failures the error type reports as transient.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Error types that can be driven by a [`RetryPolicy`]
pub trait RetryableError: std::fmt::Display {
    /// Whether another attempt may succeed (timeouts, unavailable service)
    fn is_transient(&self) -> bool;

    /// Build the error reported when an attempt exceeds its timeout
    fn timed_out(after: Duration) -> Self;
}

/// Attempt count, backoff schedule and per-attempt timeout
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Growth factor applied to the delay on each further retry
    pub multiplier: f64,
    /// Upper bound for a single delay
    pub max_backoff: Duration,
    /// Fraction of the delay that may be randomly shaved off (0.0–1.0)
    pub jitter: f64,
    /// Timeout applied to every individual attempt
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(500),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(5),
            jitter: 0.2,
            attempt_timeout: Duration::from_secs(20),
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt
    #[must_use]
    pub const fn single_attempt(attempt_timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            multiplier: 1.0,
            max_backoff: Duration::ZERO,
            jitter: 0.0,
            attempt_timeout,
        }
    }

    /// Set the per-attempt timeout
    #[must_use]
    pub const fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Deterministic delay before retry number `retry` (1-based), before jitter
    #[must_use]
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.max(0.0).powi(exponent);
        let capped = secs.min(self.max_backoff.as_secs_f64());

        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_backoff
        }
    }

    fn jittered(&self, base: Duration) -> Duration {
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        let shave: f64 = rand::thread_rng().gen_range(0.0..jitter);
        base.mul_f64(1.0 - shave)
    }

    /// Run `call` under this policy
    ///
    /// `call` is invoked once per attempt. Each attempt is bounded by
    /// `attempt_timeout`; an elapsed timeout becomes `E::timed_out`.
    ///
    /// # Errors
    ///
    /// Returns the last error once attempts are exhausted, or the first
    /// non-transient error immediately
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, E>
    where
        E: RetryableError,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let outcome = tokio::time::timeout(self.attempt_timeout, call())
                .await
                .unwrap_or_else(|_| Err(E::timed_out(self.attempt_timeout)));

            match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(operation, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.jittered(self.backoff_for(attempt));
                    tracing::warn!(
                        operation,
                        attempt,
                        error = %e,
                        ?delay,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::debug!(operation, attempt, error = %e, "giving up");
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Unavailable,
        Fatal,
        TimedOut,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl RetryableError for TestError {
        fn is_transient(&self) -> bool {
            matches!(self, Self::Unavailable | Self::TimedOut)
        }

        fn timed_out(_after: Duration) -> Self {
            Self::TimedOut
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(1),
            jitter: 0.0,
            attempt_timeout: Duration::from_millis(200),
            ..RetryPolicy::default()
        }
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<(), TestError> = fast_policy()
            .run("test", || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::Unavailable)
                }
            })
            .await;

        assert_eq!(result, Err(TestError::Unavailable));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_second_attempt_can_succeed() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result = fast_policy()
            .run("test", || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(TestError::Unavailable)
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_terminal_failure_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<(), TestError> = fast_policy()
            .run("test", || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::Fatal)
                }
            })
            .await;

        assert_eq!(result, Err(TestError::Fatal));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slow_attempt_times_out() {
        let policy = RetryPolicy {
            attempt_timeout: Duration::from_millis(10),
            ..fast_policy()
        };

        let result: Result<(), TestError> = policy
            .run("test", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert_eq!(result, Err(TestError::TimedOut));
    }

    #[test]
    fn test_backoff_schedule_grows_and_caps() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(125),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(375),
            ..RetryPolicy::default()
        };

        assert_eq!(policy.backoff_for(1), Duration::from_millis(125));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(250));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(375));
    }

    #[test]
    fn test_single_attempt_policy() {
        let policy = RetryPolicy::single_attempt(Duration::from_secs(1));
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.backoff_for(1), Duration::ZERO);
    }
}
