//! Retry with configurable backoff and jitter
//!
//! A [`RetryPolicy`] re-runs a fallible operation up to `max_attempts`
//! times, sleeping between attempts according to the configured strategy.
//! Errors whose retryable flag is false are raised immediately; the
//! wrapped operation runs exactly once for those.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::errors::ChimeraError;

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    /// `min(base * 2^attempt, max)`
    Exponential,
    /// `min(base * (attempt + 1), max)`
    Linear,
    /// `base` every time
    Constant,
}

/// A reusable retry configuration.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    strategy: RetryStrategy,
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
    should_retry: Option<Arc<dyn Fn(&ChimeraError) -> bool + Send + Sync>>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("strategy", &self.strategy)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .finish()
    }
}

impl RetryPolicy {
    /// Creates a policy with the given strategy. Jitter is on and the
    /// delay cap is 60 seconds unless overridden.
    #[must_use]
    pub fn new(max_attempts: u32, strategy: RetryStrategy, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            strategy,
            base_delay,
            max_delay: Duration::from_secs(60),
            jitter: true,
            should_retry: None,
        }
    }

    /// Exponential backoff policy.
    #[must_use]
    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self::new(max_attempts, RetryStrategy::Exponential, base_delay)
    }

    /// Linear backoff policy.
    #[must_use]
    pub fn linear(max_attempts: u32, base_delay: Duration) -> Self {
        Self::new(max_attempts, RetryStrategy::Linear, base_delay)
    }

    /// Constant-delay policy.
    #[must_use]
    pub fn constant(max_attempts: u32, base_delay: Duration) -> Self {
        Self::new(max_attempts, RetryStrategy::Constant, base_delay)
    }

    /// Overrides the delay cap.
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Enables or disables the ±25% jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Adds a predicate restricting which errors are retried. The
    /// error's own retryable flag always wins: a non-retryable error is
    /// never retried regardless of the predicate.
    #[must_use]
    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ChimeraError) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    /// The un-jittered delay after the given 0-indexed failed attempt.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = match self.strategy {
            RetryStrategy::Exponential => {
                let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
            RetryStrategy::Linear => self.base_delay.saturating_mul(attempt.saturating_add(1)),
            RetryStrategy::Constant => self.base_delay,
        };
        delay.min(self.max_delay)
    }

    fn next_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        if self.jitter {
            let factor = rand::rng().random_range(0.75..=1.25);
            Duration::from_secs_f64(delay.as_secs_f64() * factor)
        } else {
            delay
        }
    }

    fn is_retryable(&self, err: &ChimeraError) -> bool {
        err.is_retryable()
            && self
                .should_retry
                .as_ref()
                .is_none_or(|predicate| predicate(err))
    }

    /// Runs an async operation under this policy.
    ///
    /// # Errors
    /// Returns the first non-retryable error, or the last error once all
    /// attempts are exhausted.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T, ChimeraError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ChimeraError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !self.is_retryable(&err) {
                        return Err(err);
                    }
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        error!(
                            attempts = self.max_attempts,
                            error = %err,
                            "all retry attempts failed"
                        );
                        return Err(err);
                    }
                    let delay = self.next_delay(attempt - 1);
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Runs a blocking operation under this policy, sleeping on the
    /// current thread between attempts. For use outside the async
    /// runtime only.
    ///
    /// # Errors
    /// Same semantics as [`RetryPolicy::run`].
    pub fn run_blocking<T, F>(&self, mut operation: F) -> Result<T, ChimeraError>
    where
        F: FnMut() -> Result<T, ChimeraError>,
    {
        let mut attempt: u32 = 0;
        loop {
            match operation() {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !self.is_retryable(&err) {
                        return Err(err);
                    }
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        return Err(err);
                    }
                    std::thread::sleep(self.next_delay(attempt - 1));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn transient() -> ChimeraError {
        ChimeraError::data_source("test", "transient failure")
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_third_attempt_with_exponential_delays() {
        let policy = RetryPolicy::exponential(3, Duration::from_millis(10)).with_jitter(false);
        let calls = AtomicUsize::new(0);
        let started = tokio::time::Instant::now();

        let result = policy
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(transient())
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Exponential without jitter: 10ms + 20ms of sleeping
        assert_eq!(started.elapsed(), Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_non_retryable_error_called_exactly_once() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(1)).with_jitter(false);
        let calls = AtomicUsize::new(0);

        let result: Result<(), _> = policy
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ChimeraError::data_processing("malformed")) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let policy = RetryPolicy::constant(3, Duration::from_millis(5)).with_jitter(false);
        let calls = AtomicUsize::new(0);

        let result: Result<(), _> = policy
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(transient()) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_predicate_restricts_retries() {
        let policy = RetryPolicy::constant(5, Duration::from_millis(1))
            .with_jitter(false)
            .should_retry(|err| err.message().contains("again"));
        let calls = AtomicUsize::new(0);

        let result: Result<(), _> = policy
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ChimeraError::data_source("test", "do not repeat")) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delay_strategies() {
        let expo = RetryPolicy::exponential(5, Duration::from_secs(1));
        assert_eq!(expo.delay_for(0), Duration::from_secs(1));
        assert_eq!(expo.delay_for(1), Duration::from_secs(2));
        assert_eq!(expo.delay_for(2), Duration::from_secs(4));

        let linear = RetryPolicy::linear(5, Duration::from_secs(1));
        assert_eq!(linear.delay_for(0), Duration::from_secs(1));
        assert_eq!(linear.delay_for(2), Duration::from_secs(3));

        let constant = RetryPolicy::constant(5, Duration::from_secs(1));
        assert_eq!(constant.delay_for(4), Duration::from_secs(1));
    }

    #[test]
    fn test_delay_caps_at_max() {
        let policy =
            RetryPolicy::exponential(20, Duration::from_secs(1)).with_max_delay(Duration::from_secs(60));
        assert_eq!(policy.delay_for(10), Duration::from_secs(60));
        // Large exponents must not overflow
        assert_eq!(policy.delay_for(40), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_stays_within_25_percent() {
        let policy = RetryPolicy::constant(3, Duration::from_millis(100));
        for _ in 0..50 {
            let delay = policy.next_delay(0);
            assert!(delay >= Duration::from_millis(75), "delay {delay:?} below -25%");
            assert!(delay <= Duration::from_millis(125), "delay {delay:?} above +25%");
        }
    }

    #[test]
    fn test_run_blocking_retries_then_succeeds() {
        let policy = RetryPolicy::constant(3, Duration::from_millis(1)).with_jitter(false);
        let calls = AtomicUsize::new(0);

        let result = policy.run_blocking(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 1 { Err(transient()) } else { Ok(7) }
        });

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
