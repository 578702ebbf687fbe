//! Bounded retry for transient store errors

use smsgate_core::{AppError, AppResult};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry budget applied at ledger-transaction boundaries
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(25),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// Run `op`, retrying while the error is retryable and attempts remain.
    /// Backoff grows linearly with the attempt number.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.attempts => {
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying",
                        operation, attempt, self.attempts, e
                    );
                    tokio::time::sleep(self.backoff * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Run a best-effort call under `budget`; a timeout is reported as a
/// connection error so callers treat it like any other cache failure.
pub async fn within<T, Fut>(budget: Duration, fut: Fut) -> AppResult<T>
where
    Fut: Future<Output = AppResult<T>>,
{
    tokio::time::timeout(budget, fut).await.unwrap_or_else(|_| {
        Err(AppError::CacheConnection(format!(
            "timed out after {}ms",
            budget.as_millis()
        )))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retries_transient_errors() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(1));

        let result = policy
            .run("op", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(AppError::ConflictRetryable("deadlock".into()))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(2, Duration::from_millis(1));

        let result: AppResult<()> = policy
            .run("op", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AppError::LedgerTimeout(10))
            })
            .await;

        assert!(matches!(result, Err(AppError::LedgerTimeout(10))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_does_not_retry_permanent_errors() {
        let calls = AtomicU32::new(0);
        let result: AppResult<()> = RetryPolicy::default()
            .run("op", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AppError::UserNotFound("u".into()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_within_times_out() {
        let result: AppResult<()> = within(Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(AppError::CacheConnection(_))));
    }
}
