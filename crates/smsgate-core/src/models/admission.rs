//! Outcomes of admission and ledger settlement operations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Lane, MessageStatus, Reservation, UserId};

/// Synchronous admission result returned to the intake caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AdmissionDecision {
    Admitted {
        /// `None` on the privileged lane, which holds no reservation
        reservation_id: Option<Uuid>,
        lane: Lane,
    },
    Rejected {
        reason: String,
    },
    /// The message id was already submitted
    Duplicate {
        status: MessageStatus,
    },
}

impl AdmissionDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionDecision::Admitted { .. })
    }
}

/// Result of a ledger-side reservation attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerReserve {
    Reserved {
        reservation: Reservation,
        balance_after: i64,
    },
    Insufficient {
        balance: i64,
    },
    Duplicate {
        status: MessageStatus,
    },
}

/// Standard-lane settlement pre-step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Reservation marked used
    Claimed { reservation_id: Uuid },
    /// A previous attempt already consumed the reservation
    AlreadyClaimed { reservation_id: Uuid },
    /// Reservation had been reclaimed; the user was debited again
    Rebilled { reservation_id: Uuid },
    /// Reservation had been reclaimed and the user can no longer pay
    Insufficient { balance: i64 },
    /// Message is already in a terminal state
    NotQueued { status: MessageStatus },
}

impl ClaimOutcome {
    /// The message may be handed to the carrier
    pub fn may_deliver(&self) -> bool {
        matches!(
            self,
            ClaimOutcome::Claimed { .. }
                | ClaimOutcome::AlreadyClaimed { .. }
                | ClaimOutcome::Rebilled { .. }
        )
    }
}

/// Privileged-lane post-delivery billing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegedSettlement {
    Settled { balance_after: i64 },
    /// Balance could not cover the cost; message marked `error`
    BillingFailed { balance: i64 },
    AlreadyTerminal { status: MessageStatus },
}

/// A reservation credited back by the sweeper
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclaimedReservation {
    pub reservation_id: Uuid,
    pub user_id: UserId,
    pub amount: i64,
    pub expired_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_outcome_delivery_gate() {
        let id = Uuid::new_v4();
        assert!(ClaimOutcome::Claimed { reservation_id: id }.may_deliver());
        assert!(ClaimOutcome::Rebilled { reservation_id: id }.may_deliver());
        assert!(!ClaimOutcome::Insufficient { balance: 0 }.may_deliver());
        assert!(!ClaimOutcome::NotQueued {
            status: MessageStatus::Sent
        }
        .may_deliver());
    }

    #[test]
    fn test_decision_serialization() {
        let decision = AdmissionDecision::Admitted {
            reservation_id: None,
            lane: Lane::Privileged,
        };
        let value = serde_json::to_value(&decision).unwrap();
        assert_eq!(value["decision"], "admitted");
        assert_eq!(value["lane"], "privileged");
    }
}
