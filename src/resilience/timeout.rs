//! Deadline enforcement for async operations

use std::time::Duration;

use crate::errors::ChimeraError;

/// Runs an operation with a deadline. The future is dropped (cancelled)
/// when the budget is exceeded and a retryable timeout error is returned,
/// suitable for pairing with a retry policy.
///
/// # Errors
/// Returns a timeout error when the deadline passes, otherwise the
/// operation's own result.
pub async fn with_timeout<T, Fut>(limit: Duration, operation: Fut) -> Result<T, ChimeraError>
where
    Fut: Future<Output = Result<T, ChimeraError>>,
{
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => Err(ChimeraError::timeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCode;

    #[tokio::test(start_paused = true)]
    async fn test_completes_within_budget() {
        let result = with_timeout(Duration::from_secs(1), async {
            Ok::<_, ChimeraError>("done")
        })
        .await;
        assert_eq!(result.unwrap(), "done");
    }

    #[tokio::test(start_paused = true)]
    async fn test_exceeding_budget_yields_retryable_timeout() {
        let result: Result<(), _> = with_timeout(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;

        let err = result.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.code(), ErrorCode::DataSourceTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inner_error_passes_through() {
        let result: Result<(), _> = with_timeout(Duration::from_secs(1), async {
            Err(ChimeraError::user("nope"))
        })
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidInput);
    }
}
