//! Expired reservation reclamation

use crate::retry::RetryPolicy;
use chrono::Utc;
use smsgate_core::{
    config::SweeperConfig,
    traits::{LedgerStore, ReservationCache},
    AppResult,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Credits unused, expired reservations back to their users
pub struct ReservationSweeper {
    ledger: Arc<dyn LedgerStore>,
    cache: Arc<dyn ReservationCache>,
    batch_size: i64,
    retry: RetryPolicy,
}

impl ReservationSweeper {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        cache: Arc<dyn ReservationCache>,
        config: &SweeperConfig,
    ) -> Self {
        Self {
            ledger,
            cache,
            batch_size: config.batch_size.max(1),
            retry: RetryPolicy::default(),
        }
    }

    /// One pass; returns the number of reservations reclaimed
    pub async fn sweep(&self) -> AppResult<usize> {
        let now = Utc::now();
        let reclaimed = self
            .retry
            .run("reclaim_expired", || {
                self.ledger.reclaim_expired(self.batch_size, now)
            })
            .await?;

        if reclaimed.is_empty() {
            debug!("No expired reservations");
            return Ok(0);
        }

        let users: BTreeSet<_> = reclaimed.iter().map(|r| r.user_id).collect();
        for user_id in users {
            if let Err(e) = self.cache.invalidate(user_id).await {
                warn!("Failed to invalidate counter for {}: {}", user_id, e);
            }
            if let Err(e) = self.cache.invalidate_user_snapshot(user_id).await {
                warn!("Failed to invalidate snapshot for {}: {}", user_id, e);
            }
        }

        let amount: i64 = reclaimed.iter().map(|r| r.amount).sum();
        info!(
            "Reclaimed {} expired reservations ({} tokens)",
            reclaimed.len(),
            amount
        );
        Ok(reclaimed.len())
    }

    /// Sweep every `interval` until `shutdown` fires
    pub async fn run(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        info!("Reservation sweeper running every {:?}", interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!("Reservation sweep failed: {}", e);
                    }
                }
            }
        }

        info!("Reservation sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smsgate_cache::MemoryReservationCache;
    use smsgate_core::models::{LedgerReserve, Message, MessageStatus, User};
    use smsgate_db::MemoryLedger;
    use uuid::Uuid;

    async fn reserve(ledger: &MemoryLedger, user_id: Uuid, ttl: chrono::Duration) -> Uuid {
        let message = Message::new(
            Uuid::new_v4(),
            user_id,
            "5551234567".to_string(),
            "hi".to_string(),
            1,
            MessageStatus::Queued,
        );
        match ledger.reserve_locked(&message, ttl).await.unwrap() {
            LedgerReserve::Reserved { reservation, .. } => reservation.id,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sweep_reclaims_only_expired() {
        let ledger = Arc::new(MemoryLedger::new());
        let cache = Arc::new(MemoryReservationCache::new());
        let user = User::new(Uuid::new_v4(), 3, false);
        let user_id = user.id;
        ledger.insert_user(user);

        reserve(&ledger, user_id, chrono::Duration::seconds(-1)).await;
        reserve(&ledger, user_id, chrono::Duration::seconds(-1)).await;
        let live = reserve(&ledger, user_id, chrono::Duration::seconds(300)).await;
        cache
            .set_available(user_id, 0, Duration::from_secs(60))
            .await
            .unwrap();

        let sweeper = ReservationSweeper::new(ledger.clone(), cache.clone(), &SweeperConfig::default());
        assert_eq!(sweeper.sweep().await.unwrap(), 2);

        assert_eq!(ledger.get_balance(user_id).await.unwrap(), 2);
        assert!(ledger.reservation(live).is_some());
        assert_eq!(cache.available(user_id), None);
        assert_eq!(sweeper.sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweep_respects_batch_size() {
        let ledger = Arc::new(MemoryLedger::new());
        let user = User::new(Uuid::new_v4(), 5, false);
        let user_id = user.id;
        ledger.insert_user(user);
        for _ in 0..3 {
            reserve(&ledger, user_id, chrono::Duration::seconds(-1)).await;
        }

        let config = SweeperConfig {
            batch_size: 2,
            ..SweeperConfig::default()
        };
        let sweeper =
            ReservationSweeper::new(ledger.clone(), Arc::new(MemoryReservationCache::new()), &config);
        assert_eq!(sweeper.sweep().await.unwrap(), 2);
        assert_eq!(sweeper.sweep().await.unwrap(), 1);
        assert_eq!(ledger.get_balance(user_id).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let sweeper = ReservationSweeper::new(
            Arc::new(MemoryLedger::new()),
            Arc::new(MemoryReservationCache::new()),
            &SweeperConfig::default(),
        );
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), sweeper.run(Duration::from_secs(60), shutdown))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_reclaims_reservation_once_it_expires() {
        let ledger = Arc::new(MemoryLedger::new());
        let user = User::new(Uuid::new_v4(), 2, false);
        let user_id = user.id;
        ledger.insert_user(user);
        reserve(&ledger, user_id, chrono::Duration::seconds(1)).await;
        assert_eq!(ledger.get_balance(user_id).await.unwrap(), 1);

        let sweeper = Arc::new(ReservationSweeper::new(
            ledger.clone(),
            Arc::new(MemoryReservationCache::new()),
            &SweeperConfig::default(),
        ));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let sweeper = sweeper.clone();
            let shutdown = shutdown.clone();
            async move { sweeper.run(Duration::from_millis(50), shutdown).await }
        });

        let mut restored = false;
        for _ in 0..60 {
            if ledger.get_balance(user_id).await.unwrap() == 2 {
                restored = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(restored, "reservation was not reclaimed");
        assert_eq!(ledger.reservation_count(), 0);
    }
}
