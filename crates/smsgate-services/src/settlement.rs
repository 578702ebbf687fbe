//! Post-delivery settlement
//!
//! Standard-lane messages are already paid for: the reservation is claimed,
//! the message delivered, then the message status and the reservation are
//! finalized together. A failed delivery is not refunded.
//!
//! Privileged-lane messages are delivered first and billed afterwards. If the
//! balance can no longer cover the cost the message ends in `error` and the
//! billing failure is counted.
//!
//! Every step is idempotent, so a record redelivered after a crash settles
//! at most once.

use crate::retry::RetryPolicy;
use serde::Serialize;
use smsgate_core::{
    models::{ClaimOutcome, Lane, MessageStatus, PrivilegedSettlement, Submission},
    traits::{DeliveryChannel, LedgerStore, QueuedRecord},
    AppError, AppResult,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Final disposition of one queue record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Sent,
    Failed,
    /// Could not be billed; message marked `error`
    Error,
    /// A previous attempt already settled the message
    AlreadyTerminal(MessageStatus),
    /// Undecodable payload or unknown message
    Poison,
}

/// Per-worker counters
#[derive(Debug, Default)]
pub struct WorkerStats {
    processed: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
    errors: AtomicU64,
    poison: AtomicU64,
    billing_failures: AtomicU64,
    skipped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub processed: u64,
    pub sent: u64,
    pub failed: u64,
    pub errors: u64,
    pub poison: u64,
    pub billing_failures: u64,
    pub skipped: u64,
}

impl WorkerStats {
    pub fn record(&self, settlement: Settlement) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let counter = match settlement {
            Settlement::Sent => &self.sent,
            Settlement::Failed => &self.failed,
            Settlement::Error => &self.errors,
            Settlement::AlreadyTerminal(_) => &self.skipped,
            Settlement::Poison => &self.poison,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_billing_failure(&self) {
        self.billing_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            poison: self.poison.load(Ordering::Relaxed),
            billing_failures: self.billing_failures.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

pub struct SettlementProcessor {
    ledger: Arc<dyn LedgerStore>,
    delivery: Arc<dyn DeliveryChannel>,
    retry: RetryPolicy,
    reservation_ttl: chrono::Duration,
    delivery_timeout: Duration,
    stats: Arc<WorkerStats>,
}

impl SettlementProcessor {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        delivery: Arc<dyn DeliveryChannel>,
        retry: RetryPolicy,
        reservation_ttl: chrono::Duration,
        delivery_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            delivery,
            retry,
            reservation_ttl,
            delivery_timeout,
            stats: Arc::new(WorkerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    /// Settle one record. Retryable errors mean the record must stay
    /// uncommitted; anything else returned `Ok` may be committed.
    #[instrument(skip(self, record), fields(position = %record.position))]
    pub async fn process(&self, record: &QueuedRecord) -> AppResult<Settlement> {
        let settlement = self.settle(record).await?;
        self.stats.record(settlement);
        Ok(settlement)
    }

    async fn settle(&self, record: &QueuedRecord) -> AppResult<Settlement> {
        let submission: Submission = match serde_json::from_slice(&record.payload) {
            Ok(submission) => submission,
            Err(e) => {
                let poison = AppError::PoisonPayload {
                    position: record.position.to_string(),
                    reason: e.to_string(),
                };
                error!("{}", poison);
                return Ok(Settlement::Poison);
            }
        };
        let message_id = submission.message_id;

        let message = self
            .retry
            .run("get_message", || self.ledger.get_message(message_id))
            .await?;
        let Some(message) = message else {
            error!("Queued message {} has no ledger row", message_id);
            return Ok(Settlement::Poison);
        };
        if message.status.is_terminal() {
            debug!("Message {} already {}", message_id, message.status);
            return Ok(Settlement::AlreadyTerminal(message.status));
        }

        match record.position.lane {
            Lane::Standard => self.settle_standard(&submission).await,
            Lane::Privileged => self.settle_privileged(&submission).await,
        }
    }

    async fn settle_standard(&self, submission: &Submission) -> AppResult<Settlement> {
        let message_id = submission.message_id;
        let claim = self
            .retry
            .run("claim_reservation", || {
                self.ledger.claim_reservation(message_id, self.reservation_ttl)
            })
            .await?;

        match claim {
            ClaimOutcome::NotQueued { status } => return Ok(Settlement::AlreadyTerminal(status)),
            ClaimOutcome::Insufficient { balance } => {
                warn!(
                    "Reservation for {} was reclaimed and balance {} no longer covers it",
                    message_id, balance
                );
                self.finalize(message_id, MessageStatus::Error).await?;
                return Ok(Settlement::Error);
            }
            ClaimOutcome::Rebilled { reservation_id } => {
                info!("Re-debited {} for reclaimed message {}", reservation_id, message_id)
            }
            ClaimOutcome::Claimed { .. } | ClaimOutcome::AlreadyClaimed { .. } => {}
        }

        if self.deliver(submission).await {
            self.finalize(message_id, MessageStatus::Sent).await?;
            Ok(Settlement::Sent)
        } else {
            self.finalize(message_id, MessageStatus::Failed).await?;
            Ok(Settlement::Failed)
        }
    }

    async fn finalize(&self, message_id: Uuid, status: MessageStatus) -> AppResult<()> {
        let applied = self
            .retry
            .run("finalize_standard", || {
                self.ledger.finalize_standard(message_id, status)
            })
            .await?;
        if !applied {
            debug!("Message {} was finalized concurrently", message_id);
        }
        Ok(())
    }

    async fn settle_privileged(&self, submission: &Submission) -> AppResult<Settlement> {
        let message_id = submission.message_id;

        if !self.deliver(submission).await {
            self.retry
                .run("update_message_status", || {
                    self.ledger
                        .update_message_status(message_id, MessageStatus::Failed)
                })
                .await?;
            return Ok(Settlement::Failed);
        }

        let billed = self
            .retry
            .run("settle_privileged", || self.ledger.settle_privileged(message_id))
            .await?;

        match billed {
            PrivilegedSettlement::Settled { balance_after } => {
                debug!("Billed {} after delivery, balance {}", message_id, balance_after);
                Ok(Settlement::Sent)
            }
            PrivilegedSettlement::BillingFailed { balance } => {
                self.stats.record_billing_failure();
                error!(
                    "{} (balance {})",
                    AppError::SettlementBillingFailure(message_id.to_string()),
                    balance
                );
                Ok(Settlement::Error)
            }
            PrivilegedSettlement::AlreadyTerminal { status } => {
                Ok(Settlement::AlreadyTerminal(status))
            }
        }
    }

    /// Hand the message to the carrier; a timeout counts as a failure
    async fn deliver(&self, submission: &Submission) -> bool {
        match tokio::time::timeout(self.delivery_timeout, self.delivery.deliver(submission)).await
        {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("Delivery of {} failed: {}", submission.message_id, e);
                false
            }
            Err(_) => {
                warn!(
                    "Delivery of {} timed out after {}ms",
                    submission.message_id,
                    self.delivery_timeout.as_millis()
                );
                false
            }
        }
    }

    /// Give up on a record after a non-retryable error: mark its message
    /// `error` so it is not left `queued` forever.
    pub async fn abandon(&self, record: &QueuedRecord, cause: &AppError) {
        error!("Abandoning record at {}: {}", record.position, cause);
        self.stats.record(Settlement::Error);

        let Ok(submission) = serde_json::from_slice::<Submission>(&record.payload) else {
            return;
        };
        if let Err(e) = self
            .ledger
            .update_message_status(submission.message_id, MessageStatus::Error)
            .await
        {
            warn!(
                "Could not mark message {} as error: {}",
                submission.message_id, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::SimulatedCarrier;
    use async_trait::async_trait;
    use chrono::Utc;
    use mockall::mock;
    use smsgate_core::models::{LedgerReserve, Message, User};
    use smsgate_core::traits::QueuePosition;
    use smsgate_db::MemoryLedger;

    mock! {
        Carrier {}

        #[async_trait]
        impl DeliveryChannel for Carrier {
            async fn deliver(&self, submission: &Submission) -> Result<(), AppError>;
            fn name(&self) -> &'static str;
        }
    }

    fn carrier(succeed: bool, times: usize) -> MockCarrier {
        let mut carrier = MockCarrier::new();
        carrier.expect_deliver().times(times).returning(move |_| {
            if succeed {
                Ok(())
            } else {
                Err(AppError::DeliveryFailure("carrier said no".into()))
            }
        });
        carrier
    }

    fn processor(
        ledger: &Arc<MemoryLedger>,
        delivery: impl DeliveryChannel + 'static,
    ) -> SettlementProcessor {
        SettlementProcessor::new(
            ledger.clone(),
            Arc::new(delivery),
            RetryPolicy::new(2, Duration::from_millis(1)),
            chrono::Duration::seconds(300),
            Duration::from_millis(50),
        )
    }

    fn record(lane: Lane, submission: &Submission) -> QueuedRecord {
        QueuedRecord {
            position: QueuePosition {
                lane,
                partition: 0,
                offset: "0".into(),
            },
            payload: serde_json::to_vec(submission).unwrap(),
        }
    }

    fn message_for(submission: &Submission) -> Message {
        Message::new(
            submission.message_id,
            submission.user_id,
            submission.phone.clone(),
            submission.body.clone(),
            1,
            MessageStatus::Queued,
        )
    }

    /// Standard user with one admitted message
    async fn standard(ledger: &MemoryLedger, balance: i64) -> Submission {
        let user = User::new(Uuid::new_v4(), balance, false);
        let submission = Submission::new(Uuid::new_v4(), user.id, "5551234567", "hi");
        ledger.insert_user(user);

        let reserved = ledger
            .reserve_locked(&message_for(&submission), chrono::Duration::seconds(300))
            .await
            .unwrap();
        assert!(matches!(reserved, LedgerReserve::Reserved { .. }));
        submission
    }

    async fn privileged(ledger: &MemoryLedger, balance: i64) -> Submission {
        let user = User::new(Uuid::new_v4(), balance, true);
        let submission = Submission::new(Uuid::new_v4(), user.id, "5551234567", "hi");
        ledger.insert_user(user);
        assert_eq!(
            ledger.record_message(&message_for(&submission)).await.unwrap(),
            None
        );
        submission
    }

    #[tokio::test]
    async fn test_standard_delivery_consumes_reservation() {
        let ledger = Arc::new(MemoryLedger::new());
        let submission = standard(&ledger, 2).await;
        let processor = processor(&ledger, carrier(true, 1));

        let settlement = processor
            .process(&record(Lane::Standard, &submission))
            .await
            .unwrap();

        assert_eq!(settlement, Settlement::Sent);
        assert_eq!(ledger.get_balance(submission.user_id).await.unwrap(), 1);
        assert_eq!(ledger.reservation_count(), 0);
        assert_eq!(
            ledger.get_message_status(submission.message_id).await.unwrap(),
            Some(MessageStatus::Sent)
        );
    }

    #[tokio::test]
    async fn test_standard_failure_is_not_refunded() {
        let ledger = Arc::new(MemoryLedger::new());
        let submission = standard(&ledger, 2).await;
        let processor = processor(&ledger, carrier(false, 1));

        let settlement = processor
            .process(&record(Lane::Standard, &submission))
            .await
            .unwrap();

        assert_eq!(settlement, Settlement::Failed);
        assert_eq!(ledger.get_balance(submission.user_id).await.unwrap(), 1);
        assert_eq!(ledger.reservation_count(), 0);
    }

    #[tokio::test]
    async fn test_redelivered_record_settles_once() {
        let ledger = Arc::new(MemoryLedger::new());
        let submission = standard(&ledger, 2).await;
        let processor = processor(&ledger, carrier(true, 1));
        let record = record(Lane::Standard, &submission);

        assert_eq!(processor.process(&record).await.unwrap(), Settlement::Sent);
        assert_eq!(
            processor.process(&record).await.unwrap(),
            Settlement::AlreadyTerminal(MessageStatus::Sent)
        );
        assert_eq!(ledger.get_balance(submission.user_id).await.unwrap(), 1);

        let stats = processor.stats().snapshot();
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.skipped, 1);
    }

    #[tokio::test]
    async fn test_reclaimed_reservation_is_rebilled() {
        let ledger = Arc::new(MemoryLedger::new());
        let submission = standard(&ledger, 2).await;
        let later = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(ledger.reclaim_expired(10, later).await.unwrap().len(), 1);
        assert_eq!(ledger.get_balance(submission.user_id).await.unwrap(), 2);

        let processor = processor(&ledger, carrier(true, 1));
        let settlement = processor
            .process(&record(Lane::Standard, &submission))
            .await
            .unwrap();

        assert_eq!(settlement, Settlement::Sent);
        assert_eq!(ledger.get_balance(submission.user_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reclaimed_and_unaffordable_is_not_delivered() {
        let ledger = Arc::new(MemoryLedger::new());
        let submission = standard(&ledger, 1).await;
        let later = Utc::now() + chrono::Duration::hours(1);
        ledger.reclaim_expired(10, later).await.unwrap();
        ledger.set_balance(submission.user_id, 0).unwrap();

        let processor = processor(&ledger, carrier(true, 0));
        let settlement = processor
            .process(&record(Lane::Standard, &submission))
            .await
            .unwrap();

        assert_eq!(settlement, Settlement::Error);
        assert_eq!(ledger.get_balance(submission.user_id).await.unwrap(), 0);
        assert_eq!(
            ledger.get_message_status(submission.message_id).await.unwrap(),
            Some(MessageStatus::Error)
        );
    }

    #[tokio::test]
    async fn test_privileged_billed_after_delivery() {
        let ledger = Arc::new(MemoryLedger::new());
        let submission = privileged(&ledger, 1).await;
        let processor = processor(&ledger, carrier(true, 1));

        let settlement = processor
            .process(&record(Lane::Privileged, &submission))
            .await
            .unwrap();

        assert_eq!(settlement, Settlement::Sent);
        assert_eq!(ledger.get_balance(submission.user_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_privileged_overspend_is_a_billing_failure() {
        let ledger = Arc::new(MemoryLedger::new());
        let submission = privileged(&ledger, 0).await;
        let processor = processor(&ledger, carrier(true, 1));

        let settlement = processor
            .process(&record(Lane::Privileged, &submission))
            .await
            .unwrap();

        assert_eq!(settlement, Settlement::Error);
        assert_eq!(ledger.get_balance(submission.user_id).await.unwrap(), 0);
        assert_eq!(
            ledger.get_message_status(submission.message_id).await.unwrap(),
            Some(MessageStatus::Error)
        );
        assert_eq!(processor.stats().snapshot().billing_failures, 1);
    }

    #[tokio::test]
    async fn test_privileged_failure_is_not_billed() {
        let ledger = Arc::new(MemoryLedger::new());
        let submission = privileged(&ledger, 3).await;
        let processor = processor(&ledger, carrier(false, 1));

        let settlement = processor
            .process(&record(Lane::Privileged, &submission))
            .await
            .unwrap();

        assert_eq!(settlement, Settlement::Failed);
        assert_eq!(ledger.get_balance(submission.user_id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_delivery_timeout_counts_as_failure() {
        let ledger = Arc::new(MemoryLedger::new());
        let submission = standard(&ledger, 1).await;
        let slow = SimulatedCarrier::new(Duration::from_millis(500), 0.0);
        let processor = processor(&ledger, slow);

        let settlement = processor
            .process(&record(Lane::Standard, &submission))
            .await
            .unwrap();
        assert_eq!(settlement, Settlement::Failed);
    }

    #[tokio::test]
    async fn test_poison_payload() {
        let ledger = Arc::new(MemoryLedger::new());
        let processor = processor(&ledger, carrier(true, 0));
        let garbage = QueuedRecord {
            position: QueuePosition {
                lane: Lane::Standard,
                partition: 0,
                offset: "0".into(),
            },
            payload: b"not json".to_vec(),
        };

        assert_eq!(processor.process(&garbage).await.unwrap(), Settlement::Poison);

        let unknown = Submission::new(Uuid::new_v4(), Uuid::new_v4(), "5551234567", "hi");
        assert_eq!(
            processor
                .process(&record(Lane::Standard, &unknown))
                .await
                .unwrap(),
            Settlement::Poison
        );
        assert_eq!(processor.stats().snapshot().poison, 2);
    }
}
