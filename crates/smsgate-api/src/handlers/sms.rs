//! SMS handlers
//!
//! Submission and delivery-status endpoints.

use crate::dto::{MessageStatusResponse, SendSmsRequest, SendSmsResponse};
use actix_web::{web, HttpResponse};
use smsgate_core::models::MessageStatus;
use smsgate_core::AppError;
use smsgate_services::{Gateway, SubmitOutcome};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// Submit a message for delivery
///
/// POST /send-sms
///
/// 202 when queued, 402 when the balance cannot cover it, 200 with the
/// current status when the message id was already submitted.
#[instrument(skip(gateway, req), fields(message_id = %req.message_id))]
pub async fn send_sms(
    gateway: web::Data<Gateway>,
    req: web::Json<SendSmsRequest>,
) -> Result<HttpResponse, AppError> {
    req.validate().map_err(|e| {
        warn!("SMS request validation failed: {}", e);
        AppError::Validation(e.to_string())
    })?;

    let submission = req.to_submission()?;
    debug!(user_id = %submission.user_id, "Submitting message");

    let response = match gateway.submit(&submission).await? {
        SubmitOutcome::Queued { message_id, lane } => {
            info!(lane = %lane, "Message queued");
            HttpResponse::Accepted().json(SendSmsResponse {
                message_id,
                status: MessageStatus::Queued,
                lane: Some(lane),
                reason: None,
            })
        }
        SubmitOutcome::Rejected { message_id, reason } => {
            HttpResponse::PaymentRequired().json(SendSmsResponse {
                message_id,
                status: MessageStatus::Rejected,
                lane: None,
                reason: Some(reason),
            })
        }
        SubmitOutcome::Duplicate { message_id, status } => {
            debug!("Duplicate submission, current status {}", status);
            HttpResponse::Ok().json(SendSmsResponse {
                message_id,
                status,
                lane: None,
                reason: None,
            })
        }
    };

    Ok(response)
}

/// Get message status
///
/// GET /message-status/{message_id}
#[instrument(skip(gateway))]
pub async fn message_status(
    gateway: web::Data<Gateway>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let message_id = parse_uuid("message_id", &path)?;
    let status = gateway.status(message_id).await?;

    Ok(HttpResponse::Ok().json(MessageStatusResponse { message_id, status }))
}

pub(crate) fn parse_uuid(field: &str, value: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(value)
        .map_err(|_| AppError::Validation(format!("invalid {} format (must be UUID)", field)))
}

/// Configure SMS routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/send-sms", web::post().to(send_sms))
        .route("/message-status/{message_id}", web::get().to(message_status));
}
