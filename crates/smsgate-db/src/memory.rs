//! In-process ledger
//!
//! Holds users, reservations and messages behind a single mutex so every
//! operation is atomic with respect to every other one, matching the
//! transactional behavior of [`PgLedger`](crate::PgLedger). Used by tests and
//! single-process development setups.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use smsgate_core::{
    models::{
        ClaimOutcome, LedgerReserve, Message, MessageStatus, PrivilegedSettlement,
        ReclaimedReservation, Reservation, User, UserId,
    },
    traits::LedgerStore,
    AppError, AppResult,
};
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Default)]
struct LedgerState {
    users: HashMap<UserId, User>,
    reservations: HashMap<Uuid, Reservation>,
    messages: HashMap<Uuid, Message>,
}

impl LedgerState {
    fn user_mut(&mut self, user_id: UserId) -> AppResult<&mut User> {
        self.users
            .get_mut(&user_id)
            .ok_or_else(|| AppError::UserNotFound(user_id.to_string()))
    }

    fn hold(&mut self, message: &Message, ttl: chrono::Duration) -> LedgerReserve {
        let reservation = Reservation::new(message.user_id, message.cost, ttl);
        let mut queued = message.clone();
        queued.status = MessageStatus::Queued;
        queued.reservation_id = Some(reservation.id);

        let balance_after = match self.users.get_mut(&message.user_id) {
            Some(user) => {
                user.balance -= message.cost;
                user.balance
            }
            None => 0,
        };
        self.messages.insert(queued.message_id, queued);
        self.reservations.insert(reservation.id, reservation.clone());

        LedgerReserve::Reserved {
            reservation,
            balance_after,
        }
    }

    fn reserve(&mut self, message: &Message, ttl: chrono::Duration) -> AppResult<LedgerReserve> {
        let balance = self.user_mut(message.user_id)?.balance;

        if let Some(existing) = self.messages.get(&message.message_id) {
            return Ok(LedgerReserve::Duplicate {
                status: existing.status,
            });
        }

        if balance < message.cost {
            return Ok(LedgerReserve::Insufficient { balance });
        }

        Ok(self.hold(message, ttl))
    }
}

/// In-memory implementation of LedgerStore
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a user
    pub fn insert_user(&self, user: User) {
        self.state.lock().users.insert(user.id, user);
    }

    pub fn set_balance(&self, user_id: UserId, balance: i64) -> AppResult<()> {
        self.state.lock().user_mut(user_id)?.balance = balance;
        Ok(())
    }

    pub fn reservation(&self, reservation_id: Uuid) -> Option<Reservation> {
        self.state.lock().reservations.get(&reservation_id).cloned()
    }

    /// Sum of unused reservation amounts held for a user
    pub fn outstanding(&self, user_id: UserId) -> i64 {
        self.state
            .lock()
            .reservations
            .values()
            .filter(|r| r.user_id == user_id && !r.used)
            .map(|r| r.amount)
            .sum()
    }

    pub fn reservation_count(&self) -> usize {
        self.state.lock().reservations.len()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn get_user(&self, user_id: UserId) -> AppResult<Option<User>> {
        Ok(self.state.lock().users.get(&user_id).cloned())
    }

    async fn get_balance(&self, user_id: UserId) -> AppResult<i64> {
        self.state
            .lock()
            .users
            .get(&user_id)
            .map(|u| u.balance)
            .ok_or_else(|| AppError::UserNotFound(user_id.to_string()))
    }

    async fn get_message(&self, message_id: Uuid) -> AppResult<Option<Message>> {
        Ok(self.state.lock().messages.get(&message_id).cloned())
    }

    async fn get_message_status(&self, message_id: Uuid) -> AppResult<Option<MessageStatus>> {
        Ok(self.state.lock().messages.get(&message_id).map(|m| m.status))
    }

    async fn reserve_conditional(
        &self,
        message: &Message,
        ttl: chrono::Duration,
    ) -> AppResult<LedgerReserve> {
        self.state.lock().reserve(message, ttl)
    }

    async fn reserve_locked(
        &self,
        message: &Message,
        ttl: chrono::Duration,
    ) -> AppResult<LedgerReserve> {
        self.state.lock().reserve(message, ttl)
    }

    async fn record_message(&self, message: &Message) -> AppResult<Option<MessageStatus>> {
        let mut state = self.state.lock();
        if let Some(existing) = state.messages.get(&message.message_id) {
            return Ok(Some(existing.status));
        }
        state.user_mut(message.user_id)?;
        state.messages.insert(message.message_id, message.clone());
        Ok(None)
    }

    async fn release_reservation(&self, reservation_id: Uuid) -> AppResult<i64> {
        let mut state = self.state.lock();
        let Some(reservation) = state.reservations.get(&reservation_id).cloned() else {
            return Ok(0);
        };
        if reservation.used {
            warn!("Reservation {} already consumed; not releasing", reservation_id);
            return Ok(0);
        }

        state.user_mut(reservation.user_id)?.balance += reservation.amount;
        state.reservations.remove(&reservation_id);
        Ok(reservation.amount)
    }

    async fn update_message_status(
        &self,
        message_id: Uuid,
        status: MessageStatus,
    ) -> AppResult<bool> {
        let mut state = self.state.lock();
        match state.messages.get_mut(&message_id) {
            Some(message) if !message.status.is_terminal() => {
                message.status = status;
                message.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn claim_reservation(
        &self,
        message_id: Uuid,
        ttl: chrono::Duration,
    ) -> AppResult<ClaimOutcome> {
        let mut state = self.state.lock();
        let message = state
            .messages
            .get(&message_id)
            .cloned()
            .ok_or_else(|| AppError::MessageNotFound(message_id.to_string()))?;

        if message.status.is_terminal() {
            return Ok(ClaimOutcome::NotQueued {
                status: message.status,
            });
        }

        if let Some(reservation_id) = message.reservation_id {
            if let Some(reservation) = state.reservations.get_mut(&reservation_id) {
                if reservation.used {
                    return Ok(ClaimOutcome::AlreadyClaimed { reservation_id });
                }
                reservation.used = true;
                return Ok(ClaimOutcome::Claimed { reservation_id });
            }
        }

        let user = state.user_mut(message.user_id)?;
        if user.balance < message.cost {
            return Ok(ClaimOutcome::Insufficient {
                balance: user.balance,
            });
        }
        user.balance -= message.cost;

        let mut reservation = Reservation::new(message.user_id, message.cost, ttl);
        reservation.used = true;
        let reservation_id = reservation.id;
        state.reservations.insert(reservation_id, reservation);
        if let Some(message) = state.messages.get_mut(&message_id) {
            message.reservation_id = Some(reservation_id);
        }

        debug!("Re-debited reclaimed message {}", message_id);
        Ok(ClaimOutcome::Rebilled { reservation_id })
    }

    async fn finalize_standard(&self, message_id: Uuid, status: MessageStatus) -> AppResult<bool> {
        let mut state = self.state.lock();
        let reservation_id = match state.messages.get_mut(&message_id) {
            Some(message) if !message.status.is_terminal() => {
                message.status = status;
                message.updated_at = Utc::now();
                message.reservation_id
            }
            _ => return Ok(false),
        };

        if let Some(reservation_id) = reservation_id {
            state.reservations.remove(&reservation_id);
        }
        Ok(true)
    }

    async fn settle_privileged(&self, message_id: Uuid) -> AppResult<PrivilegedSettlement> {
        let mut state = self.state.lock();
        let message = state
            .messages
            .get(&message_id)
            .cloned()
            .ok_or_else(|| AppError::MessageNotFound(message_id.to_string()))?;

        if message.status.is_terminal() {
            return Ok(PrivilegedSettlement::AlreadyTerminal {
                status: message.status,
            });
        }

        let user = state.user_mut(message.user_id)?;
        let (outcome, status) = if user.balance >= message.cost {
            user.balance -= message.cost;
            (
                PrivilegedSettlement::Settled {
                    balance_after: user.balance,
                },
                MessageStatus::Sent,
            )
        } else {
            (
                PrivilegedSettlement::BillingFailed {
                    balance: user.balance,
                },
                MessageStatus::Error,
            )
        };

        if let Some(message) = state.messages.get_mut(&message_id) {
            message.status = status;
            message.updated_at = Utc::now();
        }
        Ok(outcome)
    }

    async fn reclaim_expired(
        &self,
        batch: i64,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<ReclaimedReservation>> {
        let mut state = self.state.lock();

        let mut expired: Vec<Reservation> = state
            .reservations
            .values()
            .filter(|r| r.is_reclaimable(now))
            .cloned()
            .collect();
        expired.sort_by_key(|r| r.expires_at);
        expired.truncate(batch.max(0) as usize);

        let mut reclaimed = Vec::with_capacity(expired.len());
        for reservation in expired {
            if let Some(user) = state.users.get_mut(&reservation.user_id) {
                user.balance += reservation.amount;
            }
            state.reservations.remove(&reservation.id);
            reclaimed.push(ReclaimedReservation {
                reservation_id: reservation.id,
                user_id: reservation.user_id,
                amount: reservation.amount,
                expired_at: reservation.expires_at,
            });
        }

        Ok(reclaimed)
    }
}
