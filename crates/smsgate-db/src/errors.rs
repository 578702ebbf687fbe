//! Mapping of sqlx errors onto `AppError`

use smsgate_core::AppError;
use tracing::error;

/// SQLSTATE codes that indicate contention rather than a broken request:
/// serialization failure, deadlock, lock not available, query cancelled
/// by `statement_timeout`.
const RETRYABLE_SQLSTATES: [&str; 4] = ["40001", "40P01", "55P03", "57014"];

/// Classify a driver error. Lock contention and transient unavailability
/// become `ConflictRetryable`; pool exhaustion becomes `Pool`.
pub fn classify_sqlx_error(context: &str, err: sqlx::Error) -> AppError {
    error!("Database error ({}): {}", context, err);

    match &err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            AppError::Pool(format!("{}: {}", context, err))
        }
        sqlx::Error::Io(_) => AppError::ConflictRetryable(format!("{}: {}", context, err)),
        sqlx::Error::Database(db_err) => match db_err.code() {
            Some(code) if RETRYABLE_SQLSTATES.iter().any(|c| code == *c) => {
                AppError::ConflictRetryable(format!("{}: {}", context, err))
            }
            _ => AppError::Database(format!("{}: {}", context, err)),
        },
        _ => AppError::Database(format!("{}: {}", context, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_timeout_is_pool_error() {
        let err = classify_sqlx_error("acquire", sqlx::Error::PoolTimedOut);
        assert!(matches!(err, AppError::Pool(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_row_not_found_is_not_retryable() {
        let err = classify_sqlx_error("select", sqlx::Error::RowNotFound);
        assert!(matches!(err, AppError::Database(_)));
        assert!(!err.is_retryable());
    }
}
