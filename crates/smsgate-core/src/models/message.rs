//! Message model
//!
//! A submitted SMS and its lifecycle status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::UserId;

/// Message lifecycle status
///
/// `queued` is the only non-terminal state. Every other state is final and
/// is never overwritten once written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Admitted and waiting for settlement
    #[default]
    Queued,
    /// Delivered to the carrier
    Sent,
    /// Carrier rejected the message
    Failed,
    /// Refused at admission for lack of funds
    Rejected,
    /// Internal failure (publish, settlement billing)
    Error,
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Queued => "queued",
            MessageStatus::Sent => "sent",
            MessageStatus::Failed => "failed",
            MessageStatus::Rejected => "rejected",
            MessageStatus::Error => "error",
        }
    }

    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "queued" => Some(MessageStatus::Queued),
            "sent" => Some(MessageStatus::Sent),
            "failed" => Some(MessageStatus::Failed),
            "rejected" => Some(MessageStatus::Rejected),
            "error" => Some(MessageStatus::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, MessageStatus::Queued)
    }
}

/// Message entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: Uuid,
    pub user_id: UserId,
    pub phone: String,
    pub body: String,
    pub cost: i64,
    pub status: MessageStatus,

    /// Reservation backing a standard-lane message
    pub reservation_id: Option<Uuid>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        message_id: Uuid,
        user_id: UserId,
        phone: impl Into<String>,
        body: impl Into<String>,
        cost: i64,
        status: MessageStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            message_id,
            user_id,
            phone: phone.into(),
            body: body.into(),
            cost,
            status,
            reservation_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}
