//! Lane worker: partition ownership and consumption loops
//!
//! Workers of one lane form a group. Every rebalance tick a worker
//! heartbeats its membership, renews the leases it holds, sheds partitions
//! above its fair share and picks up free ones. Each owned partition is
//! consumed by its own task so records of one partition are settled in
//! order while partitions proceed in parallel.

use crate::settlement::{SettlementProcessor, WorkerStats};
use smsgate_core::{
    config::WorkerConfig,
    models::Lane,
    traits::{QueuedRecord, WorkQueue},
    AppResult,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Partitions each member should own: `ceil(partitions / members)`
pub fn fair_share(partitions: u32, members: usize) -> usize {
    let members = members.max(1);
    (partitions as usize).div_ceil(members)
}

struct OwnedPartition {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

pub struct SettlementWorker {
    lane: Lane,
    member_id: String,
    queue: Arc<dyn WorkQueue>,
    processor: Arc<SettlementProcessor>,
    config: WorkerConfig,
    lease_ttl: Duration,
}

impl SettlementWorker {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        processor: Arc<SettlementProcessor>,
        config: WorkerConfig,
        lease_ttl: Duration,
    ) -> Self {
        let member_id = config
            .member_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", config.lane, Uuid::new_v4().simple()));

        Self {
            lane: config.lane,
            member_id,
            queue,
            processor,
            config,
            lease_ttl,
        }
    }

    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.processor.stats()
    }

    /// Consume the lane until `shutdown` fires, then stop the partition
    /// tasks, release their leases and leave the group.
    pub async fn run(&self, shutdown: CancellationToken) -> AppResult<()> {
        info!(
            "Worker {} starting on lane {} ({} partitions)",
            self.member_id,
            self.lane,
            self.queue.partitions()
        );

        let mut owned: HashMap<u32, OwnedPartition> = HashMap::new();
        let mut ticker = tokio::time::interval(self.config.rebalance_interval());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.rebalance(&mut owned, &shutdown).await {
                        warn!("Rebalance failed: {}", e);
                    }
                }
            }
        }

        info!("Worker {} shutting down", self.member_id);
        for (partition, owned_partition) in owned.drain() {
            self.stop_partition(partition, owned_partition).await;
        }
        if let Err(e) = self.queue.leave_group(self.lane, &self.member_id).await {
            warn!("Failed to leave group: {}", e);
        }

        let stats = self.stats().snapshot();
        info!(
            "Worker {} stopped: processed={} sent={} failed={} errors={} poison={}",
            self.member_id, stats.processed, stats.sent, stats.failed, stats.errors, stats.poison
        );
        Ok(())
    }

    async fn rebalance(
        &self,
        owned: &mut HashMap<u32, OwnedPartition>,
        shutdown: &CancellationToken,
    ) -> AppResult<()> {
        let members = self
            .queue
            .join_group(self.lane, &self.member_id, self.lease_ttl)
            .await?;
        let partitions = self.queue.partitions();
        let share = fair_share(partitions, members);

        // A task that exited on its own gives its partition back
        let finished: Vec<u32> = owned
            .iter()
            .filter(|(_, o)| o.handle.is_finished())
            .map(|(p, _)| *p)
            .collect();
        for partition in finished {
            if let Some(o) = owned.remove(&partition) {
                self.stop_partition(partition, o).await;
            }
        }

        let mut held: Vec<u32> = owned.keys().copied().collect();
        held.sort_unstable();
        for partition in held {
            let renewed = self
                .queue
                .acquire_partition(self.lane, partition, &self.member_id, self.lease_ttl)
                .await?;
            if !renewed {
                warn!("Lost lease on {}/{}", self.lane, partition);
                if let Some(o) = owned.remove(&partition) {
                    o.cancel.cancel();
                    if let Err(e) = o.handle.await {
                        error!("Partition task {}/{} panicked: {}", self.lane, partition, e);
                    }
                }
            }
        }

        while owned.len() > share {
            let Some(partition) = owned.keys().copied().max() else {
                break;
            };
            if let Some(o) = owned.remove(&partition) {
                debug!("Shedding {}/{}", self.lane, partition);
                self.stop_partition(partition, o).await;
            }
        }

        for partition in 0..partitions {
            if owned.len() >= share {
                break;
            }
            if owned.contains_key(&partition) {
                continue;
            }
            let acquired = self
                .queue
                .acquire_partition(self.lane, partition, &self.member_id, self.lease_ttl)
                .await?;
            if acquired {
                info!("Worker {} took {}/{}", self.member_id, self.lane, partition);
                owned.insert(partition, self.spawn_partition(partition, shutdown));
            }
        }

        Ok(())
    }

    fn spawn_partition(&self, partition: u32, shutdown: &CancellationToken) -> OwnedPartition {
        let cancel = shutdown.child_token();
        let consumer = PartitionConsumer {
            lane: self.lane,
            partition,
            queue: self.queue.clone(),
            processor: self.processor.clone(),
            fetch_batch: self.config.fetch_batch,
            poll_interval: self.config.poll_interval(),
            error_backoff: self.config.error_backoff(),
        };
        let handle = tokio::spawn(consumer.run(cancel.clone()));
        OwnedPartition { handle, cancel }
    }

    async fn stop_partition(&self, partition: u32, owned: OwnedPartition) {
        owned.cancel.cancel();
        if let Err(e) = owned.handle.await {
            error!("Partition task {}/{} panicked: {}", self.lane, partition, e);
        }
        if let Err(e) = self
            .queue
            .release_partition(self.lane, partition, &self.member_id)
            .await
        {
            warn!("Failed to release {}/{}: {}", self.lane, partition, e);
        }
    }
}

/// Sequential consumer of one partition
struct PartitionConsumer {
    lane: Lane,
    partition: u32,
    queue: Arc<dyn WorkQueue>,
    processor: Arc<SettlementProcessor>,
    fetch_batch: usize,
    poll_interval: Duration,
    error_backoff: Duration,
}

impl PartitionConsumer {
    async fn run(self, cancel: CancellationToken) {
        debug!("Consuming {}/{}", self.lane, self.partition);

        while !cancel.is_cancelled() {
            let pause = match self
                .queue
                .fetch(self.lane, self.partition, self.fetch_batch)
                .await
            {
                Ok(records) if records.is_empty() => self.poll_interval,
                Ok(records) => match self.drain(records, &cancel).await {
                    Ok(()) => continue,
                    Err(e) => {
                        warn!(
                            "Settlement on {}/{} interrupted: {}",
                            self.lane, self.partition, e
                        );
                        self.error_backoff
                    }
                },
                Err(e) => {
                    warn!("Fetch from {}/{} failed: {}", self.lane, self.partition, e);
                    self.error_backoff
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        debug!("Stopped consuming {}/{}", self.lane, self.partition);
    }

    /// Settle a batch in order. Stops at the first retryable error, leaving
    /// that record and the rest uncommitted for redelivery.
    async fn drain(&self, records: Vec<QueuedRecord>, cancel: &CancellationToken) -> AppResult<()> {
        for record in records {
            if cancel.is_cancelled() {
                break;
            }
            match self.processor.process(&record).await {
                Ok(settlement) => debug!("{} -> {:?}", record.position, settlement),
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => self.processor.abandon(&record, &e).await,
            }
            self.queue.commit(&record).await?;
        }
        Ok(())
    }
}
