//! Redis-backed reservation cache

use crate::keys::{user_key, wallet_tokens_key};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client, RedisError, Script};
use smsgate_core::{
    models::{UserId, UserSnapshot},
    traits::ReservationCache,
    AppError,
};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Decrement the counter by ARGV[1] only if it exists. A result below zero
/// is reported after the decrement has been undone.
const TRY_RESERVE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return false
end
local remaining = redis.call('DECRBY', KEYS[1], ARGV[1])
if remaining < 0 then
    redis.call('INCRBY', KEYS[1], ARGV[1])
end
return remaining
"#;

/// Increment the counter by ARGV[1] only if it still exists
const RESTORE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return redis.call('INCRBY', KEYS[1], ARGV[1])
end
return false
"#;

/// Redis implementation of ReservationCache
///
/// Wraps a Redis ConnectionManager; clones share the multiplexed connection.
#[derive(Clone)]
pub struct RedisReservationCache {
    manager: ConnectionManager,
    try_reserve: Script,
    restore: Script,
}

impl RedisReservationCache {
    /// Connect to Redis
    ///
    /// # Errors
    ///
    /// Returns `AppError::CacheConnection` if the connection fails
    pub async fn new(url: &str) -> Result<Self, AppError> {
        debug!("Connecting to Redis at {}", url);

        let client = Client::open(url).map_err(|e| {
            error!("Failed to create Redis client: {}", e);
            AppError::CacheConnection(format!("Invalid Redis URL: {}", e))
        })?;

        let manager = ConnectionManager::new(client).await.map_err(|e| {
            error!("Failed to establish Redis connection: {}", e);
            AppError::CacheConnection(format!("Connection failed: {}", e))
        })?;

        debug!("Redis connection established successfully");
        Ok(Self::from_manager(manager))
    }

    pub fn from_manager(manager: ConnectionManager) -> Self {
        Self {
            manager,
            try_reserve: Script::new(TRY_RESERVE_SCRIPT),
            restore: Script::new(RESTORE_SCRIPT),
        }
    }

    #[cfg(test)]
    async fn flush_db(&self) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("FLUSHDB")
            .query_async(&mut conn)
            .await
            .map_err(Self::map_redis_error)?;
        Ok(())
    }

    /// Convert RedisError to AppError
    fn map_redis_error(err: RedisError) -> AppError {
        match err.kind() {
            redis::ErrorKind::IoError => {
                error!("Redis I/O error: {}", err);
                AppError::CacheConnection(format!("I/O error: {}", err))
            }
            redis::ErrorKind::TypeError => {
                warn!("Redis type error: {}", err);
                AppError::Cache(format!("Type mismatch: {}", err))
            }
            _ => {
                error!("Redis error: {}", err);
                AppError::Cache(err.to_string())
            }
        }
    }
}

#[async_trait]
impl ReservationCache for RedisReservationCache {
    async fn try_reserve(&self, user_id: UserId, cost: i64) -> Result<Option<i64>, AppError> {
        let key = wallet_tokens_key(&user_id);
        let mut conn = self.manager.clone();

        let remaining: Option<i64> = self
            .try_reserve
            .key(&key)
            .arg(cost)
            .invoke_async(&mut conn)
            .await
            .map_err(Self::map_redis_error)?;

        match remaining {
            Some(tokens) => debug!("Cache HIT: {} -> {}", key, tokens),
            None => debug!("Cache MISS: {}", key),
        }
        Ok(remaining)
    }

    async fn restore(&self, user_id: UserId, cost: i64) -> Result<(), AppError> {
        let key = wallet_tokens_key(&user_id);
        let mut conn = self.manager.clone();

        let _: Option<i64> = self
            .restore
            .key(&key)
            .arg(cost)
            .invoke_async(&mut conn)
            .await
            .map_err(Self::map_redis_error)?;
        Ok(())
    }

    async fn set_available(
        &self,
        user_id: UserId,
        tokens: i64,
        ttl: Duration,
    ) -> Result<(), AppError> {
        let key = wallet_tokens_key(&user_id);
        debug!("SET {} = {} (TTL: {}s)", key, tokens, ttl.as_secs());
        let mut conn = self.manager.clone();

        let _: () = conn
            .set_ex(&key, tokens, ttl.as_secs().max(1))
            .await
            .map_err(Self::map_redis_error)?;
        Ok(())
    }

    async fn invalidate(&self, user_id: UserId) -> Result<(), AppError> {
        let key = wallet_tokens_key(&user_id);
        debug!("DEL {}", key);
        let mut conn = self.manager.clone();

        let _: i64 = conn.del(&key).await.map_err(Self::map_redis_error)?;
        Ok(())
    }

    async fn get_user_snapshot(&self, user_id: UserId) -> Result<Option<UserSnapshot>, AppError> {
        let key = user_key(&user_id);
        let mut conn = self.manager.clone();

        let cached: Option<String> = conn.get(&key).await.map_err(Self::map_redis_error)?;
        match cached {
            Some(json) => match serde_json::from_str(&json) {
                Ok(snapshot) => Ok(Some(snapshot)),
                Err(e) => {
                    // Treat a corrupt entry as a miss; the next write overwrites it
                    warn!("Discarding undecodable snapshot at {}: {}", key, e);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn set_user_snapshot(
        &self,
        user_id: UserId,
        snapshot: UserSnapshot,
        ttl: Duration,
    ) -> Result<(), AppError> {
        let key = user_key(&user_id);
        let json = serde_json::to_string(&snapshot)?;
        let mut conn = self.manager.clone();

        let _: () = conn
            .set_ex(&key, json, ttl.as_secs().max(1))
            .await
            .map_err(Self::map_redis_error)?;
        Ok(())
    }

    async fn invalidate_user_snapshot(&self, user_id: UserId) -> Result<(), AppError> {
        let key = user_key(&user_id);
        let mut conn = self.manager.clone();

        let _: i64 = conn.del(&key).await.map_err(Self::map_redis_error)?;
        Ok(())
    }
}
