//! Fast reservation cache for smsgate
//!
//! A non-authoritative, low-latency view of how many messages each user may
//! still be admitted for, plus a short-lived snapshot of the user's tier and
//! balance. The ledger stays the source of truth; any cache failure is
//! treated as a miss by callers.
//!
//! # Features
//!
//! - Atomic decrement-if-present and restore-if-present via Lua scripts
//! - Connection pooling via Redis ConnectionManager
//! - `MemoryReservationCache` with the same semantics for tests
//!
//! # Example
//!
//! ```no_run
//! use smsgate_cache::RedisReservationCache;
//! use smsgate_core::traits::ReservationCache;
//! use std::time::Duration;
//! use uuid::Uuid;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cache = RedisReservationCache::new("redis://127.0.0.1:6379").await?;
//!     let user = Uuid::new_v4();
//!
//!     cache.set_available(user, 5, Duration::from_secs(300)).await?;
//!     assert_eq!(cache.try_reserve(user, 1).await?, Some(4));
//!
//!     Ok(())
//! }
//! ```

pub mod keys;
pub mod memory;
pub mod redis_cache;

pub use memory::MemoryReservationCache;
pub use redis_cache::RedisReservationCache;
