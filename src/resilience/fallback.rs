//! Graceful degradation: run a primary operation, fall back on failure

use tracing::warn;

use crate::errors::ChimeraError;

/// Runs `primary`; on any failure, runs `fallback` instead.
///
/// # Errors
/// Returns the fallback's error when both fail.
pub async fn with_fallback<T, P, PF, F, FF>(primary: P, fallback: F) -> Result<T, ChimeraError>
where
    P: FnOnce() -> PF,
    PF: Future<Output = Result<T, ChimeraError>>,
    F: FnOnce() -> FF,
    FF: Future<Output = Result<T, ChimeraError>>,
{
    with_fallback_if(primary, fallback, |_| true).await
}

/// Runs `primary`; on a failure accepted by `condition`, runs `fallback`;
/// otherwise rethrows the primary's error.
///
/// # Errors
/// Returns the primary's error when the condition rejects it, or the
/// fallback's error when both fail.
pub async fn with_fallback_if<T, P, PF, F, FF, C>(
    primary: P,
    fallback: F,
    condition: C,
) -> Result<T, ChimeraError>
where
    P: FnOnce() -> PF,
    PF: Future<Output = Result<T, ChimeraError>>,
    F: FnOnce() -> FF,
    FF: Future<Output = Result<T, ChimeraError>>,
    C: FnOnce(&ChimeraError) -> bool,
{
    match primary().await {
        Ok(value) => Ok(value),
        Err(err) => {
            if condition(&err) {
                warn!(error = %err, "primary operation failed, using fallback");
                fallback().await
            } else {
                Err(err)
            }
        }
    }
}
