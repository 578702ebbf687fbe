//! In-process reservation cache with TTL expiry
//!
//! Mirrors the Redis scripts' semantics. `set_unavailable` makes every call
//! fail with a connection error so callers' degraded paths can be exercised.

use async_trait::async_trait;
use parking_lot::Mutex;
use smsgate_core::{
    models::{UserId, UserSnapshot},
    traits::ReservationCache,
    AppError,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

struct Entry<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Entry<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

#[derive(Default)]
pub struct MemoryReservationCache {
    counters: Mutex<HashMap<UserId, Entry<i64>>>,
    snapshots: Mutex<HashMap<UserId, Entry<UserSnapshot>>>,
    unavailable: AtomicBool,
}

impl MemoryReservationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Current counter value, if present and not expired
    pub fn available(&self, user_id: UserId) -> Option<i64> {
        self.counters
            .lock()
            .get(&user_id)
            .filter(|e| e.is_live())
            .map(|e| e.value)
    }

    fn check(&self) -> Result<(), AppError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::CacheConnection(
                "in-memory cache marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ReservationCache for MemoryReservationCache {
    async fn try_reserve(&self, user_id: UserId, cost: i64) -> Result<Option<i64>, AppError> {
        self.check()?;
        let mut counters = self.counters.lock();
        if !counters.get(&user_id).is_some_and(|e| e.is_live()) {
            counters.remove(&user_id);
            return Ok(None);
        }
        let Some(entry) = counters.get_mut(&user_id) else {
            return Ok(None);
        };

        let remaining = entry.value - cost;
        if remaining >= 0 {
            entry.value = remaining;
        }
        Ok(Some(remaining))
    }

    async fn restore(&self, user_id: UserId, cost: i64) -> Result<(), AppError> {
        self.check()?;
        if let Some(entry) = self
            .counters
            .lock()
            .get_mut(&user_id)
            .filter(|e| e.is_live())
        {
            entry.value += cost;
        }
        Ok(())
    }

    async fn set_available(
        &self,
        user_id: UserId,
        tokens: i64,
        ttl: Duration,
    ) -> Result<(), AppError> {
        self.check()?;
        self.counters.lock().insert(user_id, Entry::new(tokens, ttl));
        Ok(())
    }

    async fn invalidate(&self, user_id: UserId) -> Result<(), AppError> {
        self.check()?;
        self.counters.lock().remove(&user_id);
        Ok(())
    }

    async fn get_user_snapshot(&self, user_id: UserId) -> Result<Option<UserSnapshot>, AppError> {
        self.check()?;
        Ok(self
            .snapshots
            .lock()
            .get(&user_id)
            .filter(|e| e.is_live())
            .map(|e| e.value))
    }

    async fn set_user_snapshot(
        &self,
        user_id: UserId,
        snapshot: UserSnapshot,
        ttl: Duration,
    ) -> Result<(), AppError> {
        self.check()?;
        self.snapshots
            .lock()
            .insert(user_id, Entry::new(snapshot, ttl));
        Ok(())
    }

    async fn invalidate_user_snapshot(&self, user_id: UserId) -> Result<(), AppError> {
        self.check()?;
        self.snapshots.lock().remove(&user_id);
        Ok(())
    }
}
