//! Work queue for smsgate
//!
//! Two independent lanes (privileged, standard), each split into a fixed
//! number of partitions. Records with the same key always land in the same
//! partition, so one user's messages are settled in submission order.
//! Delivery is at least once: a record is fetched again until committed.
//!
//! - `RedisStreamQueue`: one Redis stream per lane partition, one consumer
//!   group per lane, partition ownership through expiring leases
//! - `MemoryQueue`: in-process implementation for tests
//! - `partition_for`: the stable key partitioner shared by both

pub mod memory;
pub mod partitioner;
pub mod redis_streams;

pub use memory::MemoryQueue;
pub use partitioner::{fnv1a_hash, partition_for};
pub use redis_streams::RedisStreamQueue;
