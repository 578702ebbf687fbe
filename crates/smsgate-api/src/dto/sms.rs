//! SMS intake DTOs
//!
//! Request and response types for the submission and lookup endpoints.

use serde::{Deserialize, Serialize};
use smsgate_core::models::{Lane, MessageStatus, Submission};
use smsgate_core::AppError;
use uuid::Uuid;
use validator::{Validate, ValidationError};

/// Minimum phone length after trimming
pub const MIN_PHONE_LEN: usize = 10;

/// Maximum body size in bytes
pub const MAX_BODY_BYTES: usize = 500;

/// Send SMS request
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SendSmsRequest {
    /// Owning user
    #[validate(custom(function = "validate_uuid"))]
    pub user_id: String,

    /// Caller-chosen idempotency key
    #[validate(custom(function = "validate_uuid"))]
    pub message_id: String,

    /// Destination number
    #[serde(alias = "phone")]
    #[validate(custom(function = "validate_phone"))]
    pub phone_number: String,

    /// Message text
    #[serde(alias = "body")]
    #[validate(custom(function = "validate_body"))]
    pub message: String,
}

fn validate_uuid(value: &str) -> Result<(), ValidationError> {
    Uuid::parse_str(value)
        .map(|_| ())
        .map_err(|_| ValidationError::new("must be a UUID"))
}

fn validate_phone(value: &str) -> Result<(), ValidationError> {
    if value.trim().len() < MIN_PHONE_LEN {
        return Err(ValidationError::new("invalid phone number"));
    }
    Ok(())
}

fn validate_body(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() || value.len() > MAX_BODY_BYTES {
        return Err(ValidationError::new("invalid message content"));
    }
    Ok(())
}

impl SendSmsRequest {
    /// Convert a validated request into the queue envelope
    pub fn to_submission(&self) -> Result<Submission, AppError> {
        let parse = |field: &str, value: &str| {
            Uuid::parse_str(value).map_err(|_| {
                AppError::Validation(format!("invalid {} format (must be UUID)", field))
            })
        };

        Ok(Submission::new(
            parse("message_id", &self.message_id)?,
            parse("user_id", &self.user_id)?,
            self.phone_number.trim(),
            self.message.clone(),
        ))
    }
}

/// Send SMS response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendSmsResponse {
    pub message_id: Uuid,
    pub status: MessageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lane: Option<Lane>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Balance lookup response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub user_id: Uuid,
    pub balance: i64,
}

/// Message status lookup response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageStatusResponse {
    pub message_id: Uuid,
    pub status: MessageStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> SendSmsRequest {
        SendSmsRequest {
            user_id: Uuid::new_v4().to_string(),
            message_id: Uuid::new_v4().to_string(),
            phone_number: " 5551234567 ".to_string(),
            message: "hello".to_string(),
        }
    }

    #[test]
    fn test_valid_request() {
        let req = request();
        assert!(req.validate().is_ok());

        let submission = req.to_submission().unwrap();
        assert_eq!(submission.phone, "5551234567");
        assert_eq!(submission.body, "hello");
    }

    #[test]
    fn test_rejects_bad_uuid() {
        let mut req = request();
        req.user_id = "not-a-uuid".to_string();
        let errors = req.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("user_id"));
    }

    #[test]
    fn test_rejects_short_phone() {
        let mut req = request();
        req.phone_number = "   12345    ".to_string();
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_body_limits() {
        let mut req = request();
        req.message = "   ".to_string();
        assert!(req.validate().is_err());

        req.message = "x".repeat(MAX_BODY_BYTES);
        assert!(req.validate().is_ok());

        req.message = "x".repeat(MAX_BODY_BYTES + 1);
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_accepts_short_field_names() {
        let json = serde_json::json!({
            "user_id": Uuid::new_v4(),
            "message_id": Uuid::new_v4(),
            "phone": "5551234567",
            "body": "hi"
        });
        let req: SendSmsRequest = serde_json::from_value(json).unwrap();
        assert_eq!(req.message, "hi");
    }
}
