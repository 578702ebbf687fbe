//! Lane routing and publish with compensation

use smsgate_core::{
    config::QueueConfig,
    models::{AdmissionDecision, Lane, MessageStatus, Submission},
    traits::{LedgerStore, QueuePosition, ReservationCache, WorkQueue},
    AppError, AppResult,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

/// Publishes admitted submissions to their lane, partitioned by user so one
/// user's messages keep their order.
pub struct DispatchRouter {
    queue: Arc<dyn WorkQueue>,
    ledger: Arc<dyn LedgerStore>,
    cache: Arc<dyn ReservationCache>,
    publish_retries: u32,
    publish_backoff: Duration,
}

impl DispatchRouter {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        ledger: Arc<dyn LedgerStore>,
        cache: Arc<dyn ReservationCache>,
        config: &QueueConfig,
    ) -> Self {
        Self {
            queue,
            ledger,
            cache,
            publish_retries: config.publish_retries.max(1),
            publish_backoff: config.publish_backoff(),
        }
    }

    /// Lane for a user's tier at admission time
    pub fn route(is_privileged: bool) -> Lane {
        Lane::for_tier(is_privileged)
    }

    /// Publish an admitted submission.
    ///
    /// When every attempt fails the reservation is returned to the user, the
    /// message is marked `error` and `PublishFailure` is returned.
    #[instrument(skip(self, submission), fields(message_id = %submission.message_id))]
    pub async fn dispatch(
        &self,
        submission: &Submission,
        decision: &AdmissionDecision,
    ) -> AppResult<QueuePosition> {
        let (reservation_id, lane) = match decision {
            AdmissionDecision::Admitted {
                reservation_id,
                lane,
            } => (*reservation_id, *lane),
            other => {
                return Err(AppError::InvalidInput(format!(
                    "cannot dispatch a submission that was not admitted: {:?}",
                    other
                )))
            }
        };

        let payload = serde_json::to_vec(submission)?;
        let key = submission.partition_key();

        let mut attempt = 1;
        let last_error = loop {
            match self.queue.publish(lane, &key, &payload).await {
                Ok(position) => {
                    info!("Queued at {}", position);
                    return Ok(position);
                }
                Err(e) if attempt < self.publish_retries => {
                    warn!(
                        "Publish attempt {}/{} failed: {}",
                        attempt, self.publish_retries, e
                    );
                    tokio::time::sleep(self.publish_backoff * attempt).await;
                    attempt += 1;
                }
                Err(e) => break e,
            }
        };

        error!(
            "Publish failed after {} attempts: {}",
            self.publish_retries, last_error
        );
        self.compensate(submission, reservation_id).await;
        Err(AppError::PublishFailure(last_error.to_string()))
    }

    /// Undo the admission of a message that never reached the queue
    async fn compensate(&self, submission: &Submission, reservation_id: Option<uuid::Uuid>) {
        if let Some(reservation_id) = reservation_id {
            match self.ledger.release_reservation(reservation_id).await {
                Ok(amount) => info!("Released {} tokens from {}", amount, reservation_id),
                Err(e) => error!("Failed to release reservation {}: {}", reservation_id, e),
            }
            if let Err(e) = self.cache.invalidate(submission.user_id).await {
                warn!("Failed to invalidate counter for {}: {}", submission.user_id, e);
            }
        }

        if let Err(e) = self
            .ledger
            .update_message_status(submission.message_id, MessageStatus::Error)
            .await
        {
            error!(
                "Failed to mark message {} as error: {}",
                submission.message_id, e
            );
        }
    }
}
