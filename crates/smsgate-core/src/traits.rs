//! Capability traits for the gateway's stores and channels
//!
//! Each external dependency (ledger, reservation cache, work queue, carrier)
//! is reached through one of these traits so components receive explicitly
//! constructed handles and tests can swap in in-process implementations.

use crate::error::AppError;
use crate::models::{
    ClaimOutcome, Lane, LedgerReserve, Message, MessageStatus, PrivilegedSettlement,
    ReclaimedReservation, Submission, User, UserId, UserSnapshot,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Authoritative, transactional store of balances, reservations and messages
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn get_user(&self, user_id: UserId) -> Result<Option<User>, AppError>;

    /// Current balance; `UserNotFound` for unknown users
    async fn get_balance(&self, user_id: UserId) -> Result<i64, AppError>;

    async fn get_message(&self, message_id: Uuid) -> Result<Option<Message>, AppError>;

    async fn get_message_status(&self, message_id: Uuid)
        -> Result<Option<MessageStatus>, AppError>;

    /// Debit `message.cost` only if the balance covers it, create the
    /// reservation and insert the message as `queued`, all in one transaction.
    async fn reserve_conditional(
        &self,
        message: &Message,
        ttl: chrono::Duration,
    ) -> Result<LedgerReserve, AppError>;

    /// Same effect as [`reserve_conditional`](Self::reserve_conditional) but
    /// takes an exclusive row lock on the user before comparing.
    async fn reserve_locked(
        &self,
        message: &Message,
        ttl: chrono::Duration,
    ) -> Result<LedgerReserve, AppError>;

    /// Insert a message row without touching the balance.
    ///
    /// Returns the existing status when the message id is already known.
    async fn record_message(&self, message: &Message) -> Result<Option<MessageStatus>, AppError>;

    /// Credit an unused reservation back and delete it. Returns the amount
    /// credited, zero when the reservation is gone or already used.
    async fn release_reservation(&self, reservation_id: Uuid) -> Result<i64, AppError>;

    /// Move a `queued` message to `status`. Terminal states are never
    /// overwritten; returns whether the row changed.
    async fn update_message_status(
        &self,
        message_id: Uuid,
        status: MessageStatus,
    ) -> Result<bool, AppError>;

    /// Mark the message's reservation used before delivery, re-debiting the
    /// user when the reservation was already reclaimed.
    async fn claim_reservation(
        &self,
        message_id: Uuid,
        ttl: chrono::Duration,
    ) -> Result<ClaimOutcome, AppError>;

    /// Write the terminal status of a standard-lane message and drop its
    /// reservation in one transaction.
    async fn finalize_standard(
        &self,
        message_id: Uuid,
        status: MessageStatus,
    ) -> Result<bool, AppError>;

    /// Debit a delivered privileged message if the balance covers it.
    async fn settle_privileged(&self, message_id: Uuid)
        -> Result<PrivilegedSettlement, AppError>;

    /// Credit back and delete up to `batch` unused reservations expired at `now`.
    async fn reclaim_expired(
        &self,
        batch: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReclaimedReservation>, AppError>;
}

/// Fast, non-authoritative reservation counter and user snapshot cache
#[async_trait]
pub trait ReservationCache: Send + Sync {
    /// Atomically take `cost` tokens if the counter exists.
    ///
    /// `None` is a miss. A negative value means the counter could not cover
    /// the cost and was left untouched.
    async fn try_reserve(&self, user_id: UserId, cost: i64) -> Result<Option<i64>, AppError>;

    /// Give back a provisional grant, only if the counter still exists.
    async fn restore(&self, user_id: UserId, cost: i64) -> Result<(), AppError>;

    async fn set_available(&self, user_id: UserId, tokens: i64, ttl: Duration)
        -> Result<(), AppError>;

    async fn invalidate(&self, user_id: UserId) -> Result<(), AppError>;

    async fn get_user_snapshot(&self, user_id: UserId) -> Result<Option<UserSnapshot>, AppError>;

    async fn set_user_snapshot(
        &self,
        user_id: UserId,
        snapshot: UserSnapshot,
        ttl: Duration,
    ) -> Result<(), AppError>;

    async fn invalidate_user_snapshot(&self, user_id: UserId) -> Result<(), AppError>;
}

/// Location of a record in a lane partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuePosition {
    pub lane: Lane,
    pub partition: u32,
    /// Broker-assigned, monotonically increasing within the partition
    pub offset: String,
}

impl fmt::Display for QueuePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.lane, self.partition, self.offset)
    }
}

/// A record read from a partition, not yet committed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedRecord {
    pub position: QueuePosition,
    pub payload: Vec<u8>,
}

/// Durable, partitioned, at-least-once work queue with two lanes
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Partitions per lane
    fn partitions(&self) -> u32;

    /// Append a record to the partition owning `key`; returns once the
    /// broker has acknowledged it.
    async fn publish(&self, lane: Lane, key: &str, payload: &[u8])
        -> Result<QueuePosition, AppError>;

    /// Register or refresh a group member. Returns the live member count.
    async fn join_group(&self, lane: Lane, member: &str, ttl: Duration)
        -> Result<usize, AppError>;

    async fn leave_group(&self, lane: Lane, member: &str) -> Result<(), AppError>;

    /// Acquire or renew exclusive ownership of a partition.
    async fn acquire_partition(
        &self,
        lane: Lane,
        partition: u32,
        member: &str,
        ttl: Duration,
    ) -> Result<bool, AppError>;

    async fn release_partition(&self, lane: Lane, partition: u32, member: &str)
        -> Result<(), AppError>;

    /// Earliest uncommitted records of a partition, redeliveries first.
    async fn fetch(&self, lane: Lane, partition: u32, max: usize)
        -> Result<Vec<QueuedRecord>, AppError>;

    /// Acknowledge a record; it will not be fetched again.
    async fn commit(&self, record: &QueuedRecord) -> Result<(), AppError>;
}

/// Downstream carrier
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    /// Hand the message to the carrier. Any error is a delivery failure.
    async fn deliver(&self, submission: &Submission) -> Result<(), AppError>;

    fn name(&self) -> &'static str;
}
