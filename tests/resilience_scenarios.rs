//! End-to-end resilience scenarios
//!
//! Exercises the retry, circuit breaker, fallback, and timeout
//! primitives together, including the canonical composition order:
//! timeout innermost, retry around it, breaker outermost.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chimera::errors::{ChimeraError, ErrorCode};
use chimera::resilience::{
    with_fallback, with_timeout, CircuitBreaker, CircuitState, RetryPolicy,
};

fn transient() -> ChimeraError {
    ChimeraError::data_source("exchange", "connection reset")
}

#[tokio::test(start_paused = true)]
async fn retry_succeeds_on_third_attempt_with_exponential_delays() {
    let policy = RetryPolicy::exponential(3, Duration::from_millis(10)).with_jitter(false);
    let calls = AtomicUsize::new(0);
    let started = tokio::time::Instant::now();

    let result = policy
        .run(|| {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(transient())
                } else {
                    Ok("ok")
                }
            }
        })
        .await;

    assert_eq!(result.unwrap(), "ok");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // Delays between the three attempts: 10ms then 20ms
    assert_eq!(started.elapsed(), Duration::from_millis(30));
}

#[tokio::test]
async fn non_retryable_error_invokes_function_exactly_once() {
    let policy = RetryPolicy::exponential(5, Duration::from_millis(10)).with_jitter(false);
    let calls = AtomicUsize::new(0);

    let result: Result<(), _> = policy
        .run(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ChimeraError::data_processing("schema mismatch")) }
        })
        .await;

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn circuit_opens_after_threshold_then_recovers() {
    let breaker = CircuitBreaker::new("scenario", 3, Duration::from_millis(100));
    let calls = AtomicUsize::new(0);

    // Three failures open the circuit
    for _ in 0..3 {
        let result: Result<(), _> = breaker
            .call(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(transient()) }
            })
            .await;
        assert!(result.is_err());
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    // Fourth call fails fast without invoking the wrapped function
    let result: Result<(), _> = breaker
        .call(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;
    let err = result.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // After the recovery timeout, two successes close it again
    tokio::time::advance(Duration::from_millis(150)).await;
    assert!(breaker.call(|| async { Ok(1) }).await.is_ok());
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    assert!(breaker.call(|| async { Ok(2) }).await.is_ok());
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn timeout_error_is_retryable_and_pairs_with_retry() {
    let policy = RetryPolicy::constant(3, Duration::from_millis(5)).with_jitter(false);
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&calls);
    let result = policy
        .run(move || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                with_timeout(Duration::from_millis(50), async move {
                    if attempt < 2 {
                        // Hangs past the deadline on the first two tries
                        tokio::time::sleep(Duration::from_secs(60)).await;
                    }
                    Ok::<_, ChimeraError>("recovered")
                })
                .await
            }
        })
        .await;

    assert_eq!(result.unwrap(), "recovered");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn full_stack_composition_breaker_counts_logical_outcomes() {
    // Timeout innermost, retry around it, breaker outermost: the breaker
    // sees one logical failure per exhausted retry sequence, not one per
    // attempt
    let breaker = Arc::new(CircuitBreaker::new("stack", 2, Duration::from_secs(60)));
    let retry = RetryPolicy::constant(3, Duration::from_millis(1)).with_jitter(false);
    let attempts = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let retry = retry.clone();
        let attempts = Arc::clone(&attempts);
        let result: Result<(), _> = breaker
            .call(|| {
                retry.run(move || {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async {
                        with_timeout(Duration::from_millis(10), async {
                            Err::<(), _>(transient())
                        })
                        .await
                    }
                })
            })
            .await;
        assert!(result.is_err());
    }

    // Two logical failures at threshold 2: open, while the inner retry
    // burned three attempts per call
    assert_eq!(breaker.state(), CircuitState::Open);
    assert_eq!(attempts.load(Ordering::SeqCst), 6);

    let untouched: Result<(), _> = breaker.call(|| async { Ok(()) }).await;
    assert!(untouched.is_err());
}

#[tokio::test]
async fn fallback_condition_gates_degradation() {
    // Retryable failure degrades to the fallback
    let degraded = with_fallback(
        || async { Err::<&str, _>(transient()) },
        || async { Ok("cached") },
    )
    .await;
    assert_eq!(degraded.unwrap(), "cached");

    // A non-retryable failure can be configured to pass through
    let passed: Result<&str, _> = chimera::resilience::with_fallback_if(
        || async { Err(ChimeraError::user("bad request")) },
        || async { Ok("cached") },
        |err| err.is_retryable(),
    )
    .await;
    assert_eq!(passed.unwrap_err().code(), ErrorCode::InvalidInput);
}

#[tokio::test]
async fn breaker_error_retryable_flag_feeds_outer_retry() {
    // The unavailable error an open breaker emits is itself retryable,
    // so an outer retry with a long enough backoff can probe again
    let breaker = Arc::new(CircuitBreaker::new("outer", 1, Duration::from_millis(5)));
    let _: Result<(), _> = breaker.call(|| async { Err(transient()) }).await;
    assert_eq!(breaker.state(), CircuitState::Open);

    let err = breaker
        .call(|| async { Ok::<(), ChimeraError>(()) })
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(err.code(), ErrorCode::DataSourceUnavailable);
}
