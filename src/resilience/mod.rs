//! Resilience primitives: retry, circuit breaker, fallback, timeout
//!
//! Each primitive wraps a fallible async operation and honors the
//! [`ChimeraError`](crate::errors::ChimeraError) retryable flag. When
//! stacking primitives, compose timeout innermost, retry around it, and
//! the circuit breaker outermost: a single call honors its deadline,
//! retries honor the per-attempt deadline, and the breaker counts logical
//! call outcomes.
//!
//! ```rust,no_run
//! # use chimera::errors::ChimeraError;
//! # async fn fetch() -> Result<u64, ChimeraError> { Ok(1) }
//! # async fn example() -> Result<u64, ChimeraError> {
//! use std::time::Duration;
//! use chimera::resilience::{CircuitBreaker, RetryPolicy, with_timeout};
//!
//! let retry = RetryPolicy::exponential(3, Duration::from_millis(250));
//! let breaker = CircuitBreaker::new("exchange-api", 5, Duration::from_secs(60));
//!
//! breaker
//!     .call(|| retry.run(|| with_timeout(Duration::from_secs(5), fetch())))
//!     .await
//! # }
//! ```

pub mod circuit_breaker;
pub mod fallback;
pub mod retry;
pub mod timeout;

pub use circuit_breaker::{
    global_registry, CircuitBreaker, CircuitBreakerRegistry, CircuitState,
};
pub use fallback::{with_fallback, with_fallback_if};
pub use retry::{RetryPolicy, RetryStrategy};
pub use timeout::with_timeout;
