//! Redis Streams work queue
//!
//! Layout for prefix `sms`:
//!
//! - `sms:{lane}:{partition}` - one stream per lane partition
//! - `sms-{lane}` - consumer group per lane
//! - `p{partition}` - consumer name inside the group, so pending entries stay
//!   attached to the partition and are re-read by whoever owns it next
//! - `sms:lease:{lane}:{partition}` - partition lease, value = owning member
//! - `sms:members:{lane}` - sorted set of members scored by heartbeat expiry

use crate::partitioner::partition_for;
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::{
    aio::ConnectionManager,
    streams::{StreamReadOptions, StreamReadReply},
    AsyncCommands, Client, RedisError, Script,
};
use smsgate_core::{
    models::Lane,
    traits::{QueuePosition, QueuedRecord, WorkQueue},
    AppError,
};
use std::collections::HashSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

/// Field carrying the record body in each stream entry
const PAYLOAD_FIELD: &str = "payload";

/// Take the lease if free, renew it if already ours
const ACQUIRE_LEASE_SCRIPT: &str = r#"
local owner = redis.call('GET', KEYS[1])
if not owner then
    redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
    return 1
end
if owner == ARGV[1] then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
    return 1
end
return 0
"#;

/// Delete the lease only if we still own it
const RELEASE_LEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Redis implementation of WorkQueue
pub struct RedisStreamQueue {
    manager: ConnectionManager,
    prefix: String,
    partitions: u32,
    acquire_lease: Script,
    release_lease: Script,
    /// Streams whose consumer group is known to exist
    groups_ready: Mutex<HashSet<String>>,
}

impl RedisStreamQueue {
    /// Connect to the broker
    ///
    /// # Errors
    ///
    /// Returns `AppError::QueueUnavailable` if the connection fails
    pub async fn new(url: &str, prefix: &str, partitions: u32) -> Result<Self, AppError> {
        debug!("Connecting to stream broker at {}", url);

        let client = Client::open(url).map_err(|e| {
            error!("Failed to create Redis client: {}", e);
            AppError::QueueUnavailable(format!("Invalid broker URL: {}", e))
        })?;

        let manager = ConnectionManager::new(client).await.map_err(|e| {
            error!("Failed to connect to stream broker: {}", e);
            AppError::QueueUnavailable(format!("Connection failed: {}", e))
        })?;

        info!(
            "Work queue ready: prefix '{}', {} partitions per lane",
            prefix, partitions
        );

        Ok(Self {
            manager,
            prefix: prefix.to_string(),
            partitions: partitions.max(1),
            acquire_lease: Script::new(ACQUIRE_LEASE_SCRIPT),
            release_lease: Script::new(RELEASE_LEASE_SCRIPT),
            groups_ready: Mutex::new(HashSet::new()),
        })
    }

    pub fn stream_key(&self, lane: Lane, partition: u32) -> String {
        format!("{}:{}:{}", self.prefix, lane, partition)
    }

    pub fn group_name(&self, lane: Lane) -> String {
        format!("{}-{}", self.prefix, lane)
    }

    fn consumer_name(partition: u32) -> String {
        format!("p{}", partition)
    }

    fn lease_key(&self, lane: Lane, partition: u32) -> String {
        format!("{}:lease:{}:{}", self.prefix, lane, partition)
    }

    fn members_key(&self, lane: Lane) -> String {
        format!("{}:members:{}", self.prefix, lane)
    }

    fn now_millis() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default()
    }

    /// Convert RedisError to AppError
    fn map_redis_error(err: RedisError) -> AppError {
        if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
            warn!("Stream broker unreachable: {}", err);
            AppError::QueueUnavailable(err.to_string())
        } else {
            error!("Stream broker error: {}", err);
            AppError::Internal(format!("Stream broker error: {}", err))
        }
    }

    /// Create the lane's consumer group on `stream` if missing
    async fn ensure_group(&self, lane: Lane, stream: &str) -> Result<(), AppError> {
        if self.groups_ready.lock().contains(stream) {
            return Ok(());
        }

        let mut conn = self.manager.clone();
        let created: Result<(), RedisError> = conn
            .xgroup_create_mkstream(stream, self.group_name(lane), "0")
            .await;
        match created {
            Ok(()) => debug!("Created consumer group on {}", stream),
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(Self::map_redis_error(e)),
        }

        self.groups_ready.lock().insert(stream.to_string());
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        opts: &StreamReadOptions,
        id: &str,
    ) -> Result<Vec<(String, Option<Vec<u8>>)>, AppError> {
        let mut conn = self.manager.clone();
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[stream], &[id], opts)
            .await
            .map_err(Self::map_redis_error)?;

        Ok(reply
            .into_iter()
            .flat_map(|r| r.keys)
            .flat_map(|k| k.ids)
            .map(|entry| {
                let payload = entry.get::<Vec<u8>>(PAYLOAD_FIELD);
                (entry.id, payload)
            })
            .collect())
    }
}

#[async_trait]
impl WorkQueue for RedisStreamQueue {
    fn partitions(&self) -> u32 {
        self.partitions
    }

    async fn publish(
        &self,
        lane: Lane,
        key: &str,
        payload: &[u8],
    ) -> Result<QueuePosition, AppError> {
        let partition = partition_for(key, self.partitions);
        let stream = self.stream_key(lane, partition);
        self.ensure_group(lane, &stream).await?;

        let mut conn = self.manager.clone();
        let offset: String = conn
            .xadd(&stream, "*", &[(PAYLOAD_FIELD, payload)])
            .await
            .map_err(Self::map_redis_error)?;

        debug!("Published to {} at {}", stream, offset);
        Ok(QueuePosition {
            lane,
            partition,
            offset,
        })
    }

    async fn join_group(
        &self,
        lane: Lane,
        member: &str,
        ttl: Duration,
    ) -> Result<usize, AppError> {
        let key = self.members_key(lane);
        let now = Self::now_millis();
        let expires_at = now + ttl.as_millis() as i64;

        let mut conn = self.manager.clone();
        let (live,): (usize,) = redis::pipe()
            .atomic()
            .zadd(&key, member, expires_at)
            .ignore()
            .zrembyscore(&key, "-inf", now)
            .ignore()
            .zcard(&key)
            .query_async(&mut conn)
            .await
            .map_err(Self::map_redis_error)?;

        Ok(live.max(1))
    }

    async fn leave_group(&self, lane: Lane, member: &str) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        let _: i64 = conn
            .zrem(self.members_key(lane), member)
            .await
            .map_err(Self::map_redis_error)?;
        Ok(())
    }

    async fn acquire_partition(
        &self,
        lane: Lane,
        partition: u32,
        member: &str,
        ttl: Duration,
    ) -> Result<bool, AppError> {
        let mut conn = self.manager.clone();
        let acquired: i64 = self
            .acquire_lease
            .key(self.lease_key(lane, partition))
            .arg(member)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(Self::map_redis_error)?;
        Ok(acquired == 1)
    }

    async fn release_partition(
        &self,
        lane: Lane,
        partition: u32,
        member: &str,
    ) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        let _: i64 = self
            .release_lease
            .key(self.lease_key(lane, partition))
            .arg(member)
            .invoke_async(&mut conn)
            .await
            .map_err(Self::map_redis_error)?;
        Ok(())
    }

    async fn fetch(
        &self,
        lane: Lane,
        partition: u32,
        max: usize,
    ) -> Result<Vec<QueuedRecord>, AppError> {
        let stream = self.stream_key(lane, partition);
        self.ensure_group(lane, &stream).await?;

        let opts = StreamReadOptions::default()
            .group(self.group_name(lane), Self::consumer_name(partition))
            .count(max.max(1));

        // Entries delivered to this partition's consumer but never acknowledged
        let mut entries = self.read_group(&stream, &opts, "0").await?;
        if entries.is_empty() {
            entries = self.read_group(&stream, &opts, ">").await?;
        } else {
            debug!("Re-reading {} pending entries on {}", entries.len(), stream);
        }

        Ok(entries
            .into_iter()
            .map(|(offset, payload)| QueuedRecord {
                position: QueuePosition {
                    lane,
                    partition,
                    offset,
                },
                // A trimmed entry keeps its id but loses its fields
                payload: payload.unwrap_or_default(),
            })
            .collect())
    }

    async fn commit(&self, record: &QueuedRecord) -> Result<(), AppError> {
        let position = &record.position;
        let stream = self.stream_key(position.lane, position.partition);

        let mut conn = self.manager.clone();
        let _: () = redis::pipe()
            .atomic()
            .xack(&stream, self.group_name(position.lane), &[&position.offset])
            .ignore()
            .xdel(&stream, &[&position.offset])
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(Self::map_redis_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_queue(prefix: &str) -> RedisStreamQueue {
        RedisStreamQueue::new("redis://127.0.0.1:6379", prefix, 4)
            .await
            .expect("Failed to connect to Redis")
    }

    fn unique_prefix() -> String {
        format!("smsgate-test-{}", RedisStreamQueue::now_millis())
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_publish_fetch_commit() {
        let queue = setup_queue(&unique_prefix()).await;

        let position = queue
            .publish(Lane::Standard, "user-1", b"{\"n\":1}")
            .await
            .unwrap();
        assert_eq!(position.partition, partition_for("user-1", 4));

        let records = queue
            .fetch(Lane::Standard, position.partition, 10)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload, b"{\"n\":1}".to_vec());

        // Uncommitted: fetched again
        let again = queue
            .fetch(Lane::Standard, position.partition, 10)
            .await
            .unwrap();
        assert_eq!(again, records);

        queue.commit(&records[0]).await.unwrap();
        let empty = queue
            .fetch(Lane::Standard, position.partition, 10)
            .await
            .unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_partition_lease_is_exclusive() {
        let queue = setup_queue(&unique_prefix()).await;
        let ttl = Duration::from_secs(5);

        assert!(queue
            .acquire_partition(Lane::Privileged, 0, "a", ttl)
            .await
            .unwrap());
        assert!(!queue
            .acquire_partition(Lane::Privileged, 0, "b", ttl)
            .await
            .unwrap());
        // Renewal by the owner
        assert!(queue
            .acquire_partition(Lane::Privileged, 0, "a", ttl)
            .await
            .unwrap());

        queue.release_partition(Lane::Privileged, 0, "a").await.unwrap();
        assert!(queue
            .acquire_partition(Lane::Privileged, 0, "b", ttl)
            .await
            .unwrap());
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_group_membership_counts_live_members() {
        let queue = setup_queue(&unique_prefix()).await;
        let ttl = Duration::from_secs(5);

        assert_eq!(queue.join_group(Lane::Standard, "a", ttl).await.unwrap(), 1);
        assert_eq!(queue.join_group(Lane::Standard, "b", ttl).await.unwrap(), 2);
        queue.leave_group(Lane::Standard, "b").await.unwrap();
        assert_eq!(queue.join_group(Lane::Standard, "a", ttl).await.unwrap(), 1);
    }
}
