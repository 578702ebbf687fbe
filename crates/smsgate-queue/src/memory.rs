//! In-process work queue
//!
//! Same partitioning, lease and at-least-once semantics as the Redis
//! implementation. `set_unavailable` makes publishes and fetches fail with
//! `QueueUnavailable` to exercise broker-outage paths.

use crate::partitioner::partition_for;
use async_trait::async_trait;
use parking_lot::Mutex;
use smsgate_core::{
    models::Lane,
    traits::{QueuePosition, QueuedRecord, WorkQueue},
    AppError,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

struct Entry {
    offset: u64,
    payload: Vec<u8>,
    committed: bool,
}

#[derive(Default)]
struct PartitionLog {
    next_offset: u64,
    entries: Vec<Entry>,
}

#[derive(Default)]
struct QueueState {
    logs: HashMap<(Lane, u32), PartitionLog>,
    leases: HashMap<(Lane, u32), (String, Instant)>,
    members: HashMap<Lane, HashMap<String, Instant>>,
}

pub struct MemoryQueue {
    partitions: u32,
    state: Mutex<QueueState>,
    unavailable: AtomicBool,
}

impl MemoryQueue {
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: partitions.max(1),
            state: Mutex::new(QueueState::default()),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Records published to a lane and not yet committed
    pub fn uncommitted(&self, lane: Lane) -> usize {
        self.state
            .lock()
            .logs
            .iter()
            .filter(|((l, _), _)| *l == lane)
            .map(|(_, log)| log.entries.iter().filter(|e| !e.committed).count())
            .sum()
    }

    /// Every record ever published to a lane, in partition then offset order
    pub fn published(&self, lane: Lane) -> Vec<Vec<u8>> {
        let state = self.state.lock();
        let mut partitions: Vec<_> = state
            .logs
            .iter()
            .filter(|((l, _), _)| *l == lane)
            .collect();
        partitions.sort_by_key(|((_, p), _)| *p);
        partitions
            .into_iter()
            .flat_map(|(_, log)| log.entries.iter().map(|e| e.payload.clone()))
            .collect()
    }

    fn check(&self) -> Result<(), AppError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::QueueUnavailable(
                "in-memory queue marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    fn partitions(&self) -> u32 {
        self.partitions
    }

    async fn publish(
        &self,
        lane: Lane,
        key: &str,
        payload: &[u8],
    ) -> Result<QueuePosition, AppError> {
        self.check()?;
        let partition = partition_for(key, self.partitions);

        let mut state = self.state.lock();
        let log = state.logs.entry((lane, partition)).or_default();
        let offset = log.next_offset;
        log.next_offset += 1;
        log.entries.push(Entry {
            offset,
            payload: payload.to_vec(),
            committed: false,
        });

        Ok(QueuePosition {
            lane,
            partition,
            offset: offset.to_string(),
        })
    }

    async fn join_group(
        &self,
        lane: Lane,
        member: &str,
        ttl: Duration,
    ) -> Result<usize, AppError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let members = state.members.entry(lane).or_default();
        members.insert(member.to_string(), now + ttl);
        members.retain(|_, expires_at| *expires_at > now);
        Ok(members.len().max(1))
    }

    async fn leave_group(&self, lane: Lane, member: &str) -> Result<(), AppError> {
        if let Some(members) = self.state.lock().members.get_mut(&lane) {
            members.remove(member);
        }
        Ok(())
    }

    async fn acquire_partition(
        &self,
        lane: Lane,
        partition: u32,
        member: &str,
        ttl: Duration,
    ) -> Result<bool, AppError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let free = match state.leases.get(&(lane, partition)) {
            None => true,
            Some((owner, expires_at)) => owner == member || *expires_at <= now,
        };
        if free {
            state
                .leases
                .insert((lane, partition), (member.to_string(), now + ttl));
        }
        Ok(free)
    }

    async fn release_partition(
        &self,
        lane: Lane,
        partition: u32,
        member: &str,
    ) -> Result<(), AppError> {
        let mut state = self.state.lock();
        if matches!(state.leases.get(&(lane, partition)), Some((owner, _)) if owner == member) {
            state.leases.remove(&(lane, partition));
        }
        Ok(())
    }

    async fn fetch(
        &self,
        lane: Lane,
        partition: u32,
        max: usize,
    ) -> Result<Vec<QueuedRecord>, AppError> {
        self.check()?;
        let state = self.state.lock();
        let Some(log) = state.logs.get(&(lane, partition)) else {
            return Ok(Vec::new());
        };

        Ok(log
            .entries
            .iter()
            .filter(|e| !e.committed)
            .take(max.max(1))
            .map(|e| QueuedRecord {
                position: QueuePosition {
                    lane,
                    partition,
                    offset: e.offset.to_string(),
                },
                payload: e.payload.clone(),
            })
            .collect())
    }

    async fn commit(&self, record: &QueuedRecord) -> Result<(), AppError> {
        let position = &record.position;
        let offset: u64 = position.offset.parse().map_err(|_| {
            AppError::InvalidInput(format!("Not a memory queue offset: {}", position.offset))
        })?;

        let mut state = self.state.lock();
        if let Some(entry) = state
            .logs
            .get_mut(&(position.lane, position.partition))
            .and_then(|log| log.entries.iter_mut().find(|e| e.offset == offset))
        {
            entry.committed = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_key_same_partition_in_order() {
        let queue = MemoryQueue::new(4);
        let first = queue.publish(Lane::Standard, "u1", b"a").await.unwrap();
        let second = queue.publish(Lane::Standard, "u1", b"b").await.unwrap();
        assert_eq!(first.partition, second.partition);

        let records = queue
            .fetch(Lane::Standard, first.partition, 10)
            .await
            .unwrap();
        let payloads: Vec<_> = records.iter().map(|r| r.payload.clone()).collect();
        assert_eq!(payloads, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[tokio::test]
    async fn test_uncommitted_records_are_redelivered() {
        let queue = MemoryQueue::new(1);
        queue.publish(Lane::Privileged, "u1", b"a").await.unwrap();
        queue.publish(Lane::Privileged, "u1", b"b").await.unwrap();

        let batch = queue.fetch(Lane::Privileged, 0, 1).await.unwrap();
        assert_eq!(batch[0].payload, b"a".to_vec());
        assert_eq!(queue.fetch(Lane::Privileged, 0, 1).await.unwrap(), batch);

        queue.commit(&batch[0]).await.unwrap();
        let next = queue.fetch(Lane::Privileged, 0, 1).await.unwrap();
        assert_eq!(next[0].payload, b"b".to_vec());
        assert_eq!(queue.uncommitted(Lane::Privileged), 1);
    }

    #[tokio::test]
    async fn test_lanes_are_independent() {
        let queue = MemoryQueue::new(1);
        queue.publish(Lane::Privileged, "u1", b"p").await.unwrap();
        assert!(queue.fetch(Lane::Standard, 0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lease_expires() {
        let queue = MemoryQueue::new(1);
        assert!(queue
            .acquire_partition(Lane::Standard, 0, "a", Duration::from_millis(0))
            .await
            .unwrap());
        assert!(queue
            .acquire_partition(Lane::Standard, 0, "b", Duration::from_secs(5))
            .await
            .unwrap());
        assert!(!queue
            .acquire_partition(Lane::Standard, 0, "a", Duration::from_secs(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_unavailable() {
        let queue = MemoryQueue::new(1);
        queue.set_unavailable(true);
        let err = queue.publish(Lane::Standard, "u1", b"x").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
