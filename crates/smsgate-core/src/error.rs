//! Unified error handling for smsgate
//!
//! Every failure in the gateway is converted to [`AppError`]. The billing
//! taxonomy (insufficient funds, retryable conflicts, publish, delivery and
//! settlement failures, poison payloads) is represented explicitly so callers
//! can decide between rejection, compensation and retry.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

/// Main application error type
#[derive(Error, Debug)]
pub enum AppError {
    // ==================== Database Errors ====================
    #[error("Database error: {0}")]
    Database(String),

    #[error("Database pool error: {0}")]
    Pool(String),

    #[error("Transaction failed: {0}")]
    Transaction(String),

    /// Lock contention or transient store unavailability.
    #[error("Retryable conflict: {0}")]
    ConflictRetryable(String),

    #[error("Ledger operation timed out after {0}ms")]
    LedgerTimeout(u64),

    // ==================== Cache Errors ====================
    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Cache connection failed: {0}")]
    CacheConnection(String),

    // ==================== Queue Errors ====================
    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Publish failed: {0}")]
    PublishFailure(String),

    #[error("Poison payload at {position}: {reason}")]
    PoisonPayload { position: String, reason: String },

    // ==================== Billing Errors ====================
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: i64, available: i64 },

    #[error("Delivery failed: {0}")]
    DeliveryFailure(String),

    #[error("Settlement billing failed for message {0}")]
    SettlementBillingFailure(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    // ==================== Validation Errors ====================
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // ==================== Internal Errors ====================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl AppError {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            AppError::Validation(_) | AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,

            // 402 Payment Required
            AppError::InsufficientFunds { .. } => StatusCode::PAYMENT_REQUIRED,

            // 404 Not Found
            AppError::UserNotFound(_) | AppError::MessageNotFound(_) => StatusCode::NOT_FOUND,

            // 429 Too Many Requests
            AppError::ConflictRetryable(_) => StatusCode::TOO_MANY_REQUESTS,

            // 503 Service Unavailable
            AppError::QueueUnavailable(_)
            | AppError::PublishFailure(_)
            | AppError::LedgerTimeout(_)
            | AppError::Pool(_) => StatusCode::SERVICE_UNAVAILABLE,

            // 500 Internal Server Error
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns the error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Database(_) => "database_error",
            AppError::Pool(_) => "pool_error",
            AppError::Transaction(_) => "transaction_error",
            AppError::ConflictRetryable(_) => "conflict_retryable",
            AppError::LedgerTimeout(_) => "ledger_timeout",
            AppError::Cache(_) => "cache_error",
            AppError::CacheConnection(_) => "cache_connection_error",
            AppError::QueueUnavailable(_) => "queue_unavailable",
            AppError::PublishFailure(_) => "publish_failure",
            AppError::PoisonPayload { .. } => "poison_payload",
            AppError::InsufficientFunds { .. } => "insufficient_funds",
            AppError::DeliveryFailure(_) => "delivery_failure",
            AppError::SettlementBillingFailure(_) => "settlement_billing_failure",
            AppError::UserNotFound(_) => "user_not_found",
            AppError::MessageNotFound(_) => "message_not_found",
            AppError::Validation(_) => "validation_error",
            AppError::InvalidInput(_) => "invalid_input",
            AppError::Internal(_) => "internal_error",
            AppError::Config(_) => "config_error",
            AppError::Serialization(_) => "serialization_error",
        }
    }

    /// Transient failures that may be retried within a bounded budget.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::ConflictRetryable(_)
                | AppError::Pool(_)
                | AppError::LedgerTimeout(_)
                | AppError::CacheConnection(_)
                | AppError::QueueUnavailable(_)
        )
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        AppError::status_code(self)
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let body = json!({
            "error": self.error_code(),
            "message": self.to_string(),
            "status": status.as_u16(),
        });

        HttpResponse::build(status).json(body)
    }
}

// ==================== From implementations ====================

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::Validation(err.to_string())
    }
}
