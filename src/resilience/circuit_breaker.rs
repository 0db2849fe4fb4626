//! Circuit breaker with a single-probe half-open state
//!
//! State machine: CLOSED counts consecutive failures and opens at the
//! threshold; OPEN fails fast with a retryable unavailable error until the
//! recovery timeout elapses; HALF_OPEN admits exactly one probe at a time
//! and closes after two consecutive probe successes.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::errors::ChimeraError;

/// Consecutive half-open successes required to close the circuit.
const SUCCESSES_TO_CLOSE: u32 = 2;

/// The three circuit states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow; failures are counted.
    Closed,
    /// Requests fail fast.
    Open,
    /// One probe at a time tests whether the service recovered.
    HalfOpen,
}

struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<Instant>,
    probe_in_flight: bool,
}

/// A named circuit breaker shared across concurrent callers of one
/// wrapped dependency.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    #[must_use]
    pub fn new(name: impl Into<String>, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// The breaker's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Decides whether a call may proceed. Returns whether the admitted
    /// call is a half-open probe.
    fn admit(&self) -> Result<bool, ChimeraError> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let recovered = inner
                    .last_failure_at
                    .is_some_and(|at| at.elapsed() >= self.recovery_timeout);
                if recovered {
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    inner.probe_in_flight = true;
                    info!(breaker = %self.name, "circuit breaker entering half-open state");
                    Ok(true)
                } else {
                    Err(ChimeraError::service_unavailable(&self.name))
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    // Only one probe at a time; everyone else fails fast
                    Err(ChimeraError::service_unavailable(&self.name))
                } else {
                    inner.probe_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    fn on_success(&self, probe: bool) {
        let mut inner = self.lock();
        if probe {
            inner.probe_in_flight = false;
        }
        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= SUCCESSES_TO_CLOSE {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    info!(breaker = %self.name, "circuit breaker closed after recovery");
                }
            }
            _ => {
                inner.failure_count = 0;
            }
        }
    }

    fn on_failure(&self, probe: bool) {
        let mut inner = self.lock();
        if probe {
            inner.probe_in_flight = false;
        }
        inner.failure_count += 1;
        inner.last_failure_at = Some(Instant::now());
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                warn!(breaker = %self.name, "circuit breaker reopened after failed probe");
            }
            CircuitState::Closed if inner.failure_count >= self.failure_threshold => {
                inner.state = CircuitState::Open;
                warn!(
                    breaker = %self.name,
                    failures = inner.failure_count,
                    "circuit breaker opened"
                );
            }
            _ => {}
        }
    }

    /// Runs an operation through the breaker.
    ///
    /// # Errors
    /// Fails fast with a retryable unavailable error while the circuit is
    /// open (or a probe is already in flight), otherwise propagates the
    /// operation's own result.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T, ChimeraError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ChimeraError>>,
    {
        let probe = self.admit()?;
        match operation().await {
            Ok(value) => {
                self.on_success(probe);
                Ok(value)
            }
            Err(err) => {
                self.on_failure(probe);
                Err(err)
            }
        }
    }

    /// The current state.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// The current consecutive-failure count.
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// Forces the breaker closed and clears all counters.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_failure_at = None;
        inner.probe_in_flight = false;
        info!(breaker = %self.name, "circuit breaker manually reset");
    }
}

/// Registry of named breakers for introspection. One lives per process via
/// [`global_registry`]; tests construct their own.
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a breaker under its own name, replacing any previous
    /// breaker with that name.
    pub fn register(&self, breaker: Arc<CircuitBreaker>) {
        self.breakers.insert(breaker.name().to_string(), breaker);
    }

    /// Looks up a breaker by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|entry| Arc::clone(&entry))
    }

    /// Returns the existing breaker with this name or creates and
    /// registers a new one.
    pub fn get_or_create(
        &self,
        name: &str,
        failure_threshold: u32,
        recovery_timeout: Duration,
    ) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.get(name) {
            return existing;
        }
        let breaker = Arc::new(CircuitBreaker::new(name, failure_threshold, recovery_timeout));
        self.register(Arc::clone(&breaker));
        breaker
    }

    /// Names of all registered breakers.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.breakers.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Forces every registered breaker closed.
    pub fn reset_all(&self) {
        for entry in &self.breakers {
            entry.value().reset();
        }
    }
}

/// The process-wide breaker registry.
pub fn global_registry() -> &'static CircuitBreakerRegistry {
    static REGISTRY: OnceLock<CircuitBreakerRegistry> = OnceLock::new();
    REGISTRY.get_or_init(CircuitBreakerRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn failing() -> ChimeraError {
        ChimeraError::data_source("test", "boom")
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_fails_fast() {
        let breaker = CircuitBreaker::new("t", 3, Duration::from_millis(100));
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let result: Result<(), _> = breaker
                .call(|| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(failing()) }
                })
                .await;
            assert!(result.is_err());
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        // Fourth call fails fast without invoking the function
        let result: Result<(), _> = breaker
            .call(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert!(result.is_err());
        assert!(result.unwrap_err().is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_through_half_open_to_closed() {
        let breaker = CircuitBreaker::new("t", 3, Duration::from_millis(100));

        for _ in 0..3 {
            let _: Result<(), _> = breaker.call(|| async { Err(failing()) }).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(150)).await;

        assert!(breaker.call(|| async { Ok(1) }).await.is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.call(|| async { Ok(2) }).await.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens() {
        let breaker = CircuitBreaker::new("t", 1, Duration::from_millis(50));
        let _: Result<(), _> = breaker.call(|| async { Err(failing()) }).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(60)).await;
        let _: Result<(), _> = breaker.call(|| async { Err(failing()) }).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_probe() {
        let breaker = Arc::new(CircuitBreaker::new("t", 1, Duration::from_millis(50)));
        let _: Result<(), _> = breaker.call(|| async { Err(failing()) }).await;
        tokio::time::advance(Duration::from_millis(60)).await;

        // Start a probe that stays in flight
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let probe_breaker = Arc::clone(&breaker);
        let probe = tokio::spawn(async move {
            probe_breaker
                .call(|| async {
                    let _ = started_tx.send(());
                    let _ = release_rx.await;
                    Ok::<_, ChimeraError>(1)
                })
                .await
        });
        started_rx.await.unwrap();

        // A concurrent caller fails fast while the probe is in flight
        let concurrent: Result<i32, _> = breaker.call(|| async { Ok(2) }).await;
        assert!(concurrent.is_err());

        let _ = release_tx.send(());
        assert!(probe.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_success_resets_failure_count_when_closed() {
        let breaker = CircuitBreaker::new("t", 3, Duration::from_millis(100));
        let _: Result<(), _> = breaker.call(|| async { Err(failing()) }).await;
        let _: Result<(), _> = breaker.call(|| async { Err(failing()) }).await;
        assert_eq!(breaker.failure_count(), 2);

        assert!(breaker.call(|| async { Ok(()) }).await.is_ok());
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_manual_reset_forces_closed() {
        let breaker = CircuitBreaker::new("t", 1, Duration::from_secs(3600));
        let _: Result<(), _> = breaker.call(|| async { Err(failing()) }).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.call(|| async { Ok(()) }).await.is_ok());
    }

    #[tokio::test]
    async fn test_registry_lookup_and_reset_all() {
        let registry = CircuitBreakerRegistry::new();
        let breaker = registry.get_or_create("exchange", 1, Duration::from_secs(60));
        assert!(registry.get("exchange").is_some());
        assert!(registry.get("missing").is_none());

        let _: Result<(), _> = breaker.call(|| async { Err(failing()) }).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        registry.reset_all();
        assert_eq!(breaker.state(), CircuitState::Closed);

        // Same instance comes back on re-request
        let again = registry.get_or_create("exchange", 9, Duration::from_secs(1));
        assert!(Arc::ptr_eq(&breaker, &again));
    }
}
