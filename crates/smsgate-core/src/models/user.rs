//! User model
//!
//! A ledger account owner: current spendable balance and routing tier.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type UserId = Uuid;

/// User entity as stored in the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,

    /// Spendable balance in message units; never negative
    pub balance: i64,

    /// Privileged users skip reservation and are billed after delivery
    pub is_privileged: bool,
}

impl User {
    pub fn new(id: UserId, balance: i64, is_privileged: bool) -> Self {
        Self {
            id,
            balance,
            is_privileged,
        }
    }

    /// Check if the balance covers a cost
    pub fn can_afford(&self, cost: i64) -> bool {
        self.balance >= cost
    }

    pub fn snapshot(&self) -> UserSnapshot {
        UserSnapshot {
            is_privileged: self.is_privileged,
            balance: self.balance,
        }
    }
}

/// Cached view of a user used on the intake path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSnapshot {
    pub is_privileged: bool,
    pub balance: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_afford() {
        let user = User::new(Uuid::new_v4(), 1, false);
        assert!(user.can_afford(1));
        assert!(!user.can_afford(2));
    }

    #[test]
    fn test_snapshot_serialization() {
        let user = User::new(Uuid::new_v4(), 42, true);
        let json = serde_json::to_string(&user.snapshot()).unwrap();
        assert!(json.contains("\"is_privileged\":true"));
        assert!(json.contains("\"balance\":42"));
    }
}
