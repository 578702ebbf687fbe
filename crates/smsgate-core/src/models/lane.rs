//! Dispatch lanes and the queued submission envelope

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::UserId;

/// One of the two independent work queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    Privileged,
    #[default]
    Standard,
}

impl Lane {
    pub const ALL: [Lane; 2] = [Lane::Privileged, Lane::Standard];

    /// Lane for a user tier
    pub fn for_tier(is_privileged: bool) -> Self {
        if is_privileged {
            Lane::Privileged
        } else {
            Lane::Standard
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Privileged => "privileged",
            Lane::Standard => "standard",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "privileged" => Some(Lane::Privileged),
            "standard" => Some(Lane::Standard),
            _ => None,
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message submission, used both as the intake payload and the queue record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub message_id: Uuid,
    pub user_id: UserId,
    pub phone: String,
    pub body: String,
}

impl Submission {
    pub fn new(
        message_id: Uuid,
        user_id: UserId,
        phone: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            message_id,
            user_id,
            phone: phone.into(),
            body: body.into(),
        }
    }

    /// Partition key; all messages of one user share a partition
    pub fn partition_key(&self) -> String {
        self.user_id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lane_for_tier() {
        assert_eq!(Lane::for_tier(true), Lane::Privileged);
        assert_eq!(Lane::for_tier(false), Lane::Standard);
        assert_eq!(Lane::from_str("Privileged"), Some(Lane::Privileged));
    }

    #[test]
    fn test_submission_json_shape() {
        let submission = Submission::new(Uuid::nil(), Uuid::nil(), "5551234567", "hi");
        let value = serde_json::to_value(&submission).unwrap();
        assert_eq!(value["phone"], "5551234567");
        assert_eq!(value["body"], "hi");
        assert_eq!(
            value["user_id"],
            "00000000-0000-0000-0000-000000000000"
        );
    }
}
