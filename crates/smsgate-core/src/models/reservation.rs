//! Reservation model
//!
//! A time-bounded hold against a user's balance. The amount has already been
//! debited from the user; the row exists so an abandoned hold can be credited
//! back once it expires unused.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::UserId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub user_id: UserId,
    pub amount: i64,

    /// Set once settlement has consumed the hold
    pub used: bool,

    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Reservation {
    pub fn new(user_id: UserId, amount: i64, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            amount,
            used: false,
            expires_at: now + ttl,
            created_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Expired and never consumed; the sweeper may credit it back
    pub fn is_reclaimable(&self, now: DateTime<Utc>) -> bool {
        !self.used && self.is_expired(now)
    }
}
