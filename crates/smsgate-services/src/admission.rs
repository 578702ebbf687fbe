//! Admission service
//!
//! Decides synchronously whether a submission is admitted. Standard users are
//! charged up front: the cost is debited and held in a reservation inside one
//! ledger transaction before the message is queued. Privileged users skip the
//! reservation and are billed after delivery.
//!
//! Two interchangeable strategies produce the ledger reservation:
//!
//! - [`CacheAssistedReserver`] takes a provisional grant from the cache
//!   counter, confirms it with a conditional ledger debit, and falls back to
//!   the row-locked path whenever the cache misses, fails, or disagrees.
//! - [`LedgerOnlyReserver`] always uses the row-locked path.
//!
//! The ledger always has the final word; the cache can never admit a request
//! the ledger would reject.

use crate::retry::{within, RetryPolicy};
use crate::router::DispatchRouter;
use async_trait::async_trait;
use smsgate_core::{
    config::{AdmissionConfig, AdmissionStrategyKind},
    models::{AdmissionDecision, LedgerReserve, Message, MessageStatus, Submission, UserId},
    traits::{LedgerStore, ReservationCache},
    AppError, AppResult,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Tunables shared by both strategies
#[derive(Debug, Clone)]
pub struct ReserveSettings {
    pub reservation_ttl: chrono::Duration,
    pub counter_ttl: Duration,
    pub cache_timeout: Duration,
    pub retry: RetryPolicy,
}

impl From<&AdmissionConfig> for ReserveSettings {
    fn from(config: &AdmissionConfig) -> Self {
        Self {
            reservation_ttl: config.reservation_ttl(),
            counter_ttl: Duration::from_secs(config.counter_ttl_secs),
            cache_timeout: config.cache_timeout(),
            retry: RetryPolicy::new(config.ledger_attempts, Duration::from_millis(25)),
        }
    }
}

/// A way of turning an admissible message into a durable ledger reservation
#[async_trait]
pub trait ReservationStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Debit `message.cost`, hold it and record the message as `queued`, or
    /// report why not. Never mutates anything on `Insufficient`.
    async fn reserve(&self, message: &Message) -> AppResult<LedgerReserve>;
}

/// Shared locked path: row lock, compare, debit, then mirror the balance
/// into the cache counter.
async fn reserve_with_lock(
    ledger: &dyn LedgerStore,
    cache: &dyn ReservationCache,
    settings: &ReserveSettings,
    message: &Message,
) -> AppResult<LedgerReserve> {
    let outcome = settings
        .retry
        .run("reserve_locked", || {
            ledger.reserve_locked(message, settings.reservation_ttl)
        })
        .await?;

    let observed = match &outcome {
        LedgerReserve::Reserved { balance_after, .. } => Some(*balance_after),
        // Heal a counter that let an unaffordable request through
        LedgerReserve::Insufficient { balance } => Some(*balance),
        LedgerReserve::Duplicate { .. } => None,
    };
    if let Some(tokens) = observed {
        refresh_counter(cache, settings, message.user_id, tokens).await;
    }

    Ok(outcome)
}

async fn refresh_counter(
    cache: &dyn ReservationCache,
    settings: &ReserveSettings,
    user_id: UserId,
    tokens: i64,
) {
    let refreshed = within(
        settings.cache_timeout,
        cache.set_available(user_id, tokens, settings.counter_ttl),
    )
    .await;
    if let Err(e) = refreshed {
        debug!("Could not refresh reservation counter for {}: {}", user_id, e);
    }
}

/// Ledger row lock on every admission
pub struct LedgerOnlyReserver {
    ledger: Arc<dyn LedgerStore>,
    cache: Arc<dyn ReservationCache>,
    settings: ReserveSettings,
}

impl LedgerOnlyReserver {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        cache: Arc<dyn ReservationCache>,
        settings: ReserveSettings,
    ) -> Self {
        Self {
            ledger,
            cache,
            settings,
        }
    }
}

#[async_trait]
impl ReservationStrategy for LedgerOnlyReserver {
    fn name(&self) -> &'static str {
        "ledger_only"
    }

    async fn reserve(&self, message: &Message) -> AppResult<LedgerReserve> {
        reserve_with_lock(
            self.ledger.as_ref(),
            self.cache.as_ref(),
            &self.settings,
            message,
        )
        .await
    }
}

/// Cache counter first, ledger confirmation
pub struct CacheAssistedReserver {
    ledger: Arc<dyn LedgerStore>,
    cache: Arc<dyn ReservationCache>,
    settings: ReserveSettings,
}

impl CacheAssistedReserver {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        cache: Arc<dyn ReservationCache>,
        settings: ReserveSettings,
    ) -> Self {
        Self {
            ledger,
            cache,
            settings,
        }
    }

    /// Give a provisional grant back to the counter
    async fn undo_grant(&self, message: &Message) {
        let restored = within(
            self.settings.cache_timeout,
            self.cache.restore(message.user_id, message.cost),
        )
        .await;
        if let Err(e) = restored {
            // The counter is a hint; a lost restore only makes it pessimistic
            debug!("Could not restore counter for {}: {}", message.user_id, e);
        }
    }
}

#[async_trait]
impl ReservationStrategy for CacheAssistedReserver {
    fn name(&self) -> &'static str {
        "cache_assisted"
    }

    async fn reserve(&self, message: &Message) -> AppResult<LedgerReserve> {
        let grant = within(
            self.settings.cache_timeout,
            self.cache.try_reserve(message.user_id, message.cost),
        )
        .await;

        match grant {
            Ok(Some(remaining)) if remaining >= 0 => {
                let confirmed = self
                    .settings
                    .retry
                    .run("reserve_conditional", || {
                        self.ledger
                            .reserve_conditional(message, self.settings.reservation_ttl)
                    })
                    .await;

                match confirmed {
                    Ok(reserved @ LedgerReserve::Reserved { .. }) => return Ok(reserved),
                    Ok(LedgerReserve::Duplicate { status }) => {
                        self.undo_grant(message).await;
                        return Ok(LedgerReserve::Duplicate { status });
                    }
                    Ok(LedgerReserve::Insufficient { balance }) => {
                        warn!(
                            "Cache granted {} tokens to {} but ledger balance is {}",
                            message.cost, message.user_id, balance
                        );
                        self.undo_grant(message).await;
                    }
                    Err(e) => {
                        warn!("Conditional debit failed for {}: {}", message.user_id, e);
                        self.undo_grant(message).await;
                        if matches!(e, AppError::UserNotFound(_)) {
                            return Err(e);
                        }
                    }
                }
            }
            Ok(Some(remaining)) => {
                debug!(
                    "Counter for {} cannot cover cost ({}); asking the ledger",
                    message.user_id, remaining
                );
            }
            Ok(None) => debug!("Counter miss for {}", message.user_id),
            Err(e) => debug!("Counter unavailable for {}: {}", message.user_id, e),
        }

        reserve_with_lock(
            self.ledger.as_ref(),
            self.cache.as_ref(),
            &self.settings,
            message,
        )
        .await
    }
}

/// Build the configured strategy
pub fn build_strategy(
    config: &AdmissionConfig,
    ledger: Arc<dyn LedgerStore>,
    cache: Arc<dyn ReservationCache>,
) -> Arc<dyn ReservationStrategy> {
    let settings = ReserveSettings::from(config);
    match config.strategy {
        AdmissionStrategyKind::CacheAssisted => {
            Arc::new(CacheAssistedReserver::new(ledger, cache, settings))
        }
        AdmissionStrategyKind::LedgerOnly => {
            Arc::new(LedgerOnlyReserver::new(ledger, cache, settings))
        }
    }
}

/// Admission service
pub struct AdmissionService {
    ledger: Arc<dyn LedgerStore>,
    cache: Arc<dyn ReservationCache>,
    strategy: Arc<dyn ReservationStrategy>,
    config: AdmissionConfig,
}

impl AdmissionService {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        cache: Arc<dyn ReservationCache>,
        strategy: Arc<dyn ReservationStrategy>,
        config: AdmissionConfig,
    ) -> Self {
        info!("Admission strategy: {}", strategy.name());
        Self {
            ledger,
            cache,
            strategy,
            config,
        }
    }

    /// Admit a submission at the configured per-message cost
    pub async fn admit(&self, submission: &Submission) -> AppResult<AdmissionDecision> {
        self.admit_with_cost(submission, self.config.message_cost)
            .await
    }

    /// Admit a submission at an explicit cost
    #[instrument(skip(self, submission), fields(message_id = %submission.message_id, user_id = %submission.user_id))]
    pub async fn admit_with_cost(
        &self,
        submission: &Submission,
        cost: i64,
    ) -> AppResult<AdmissionDecision> {
        if cost <= 0 {
            return Err(AppError::InvalidInput(format!(
                "cost must be positive, got {}",
                cost
            )));
        }

        let is_privileged = self.is_privileged(submission.user_id).await?;
        let mut message = Message::new(
            submission.message_id,
            submission.user_id,
            submission.phone.clone(),
            submission.body.clone(),
            cost,
            MessageStatus::Queued,
        );

        let lane = DispatchRouter::route(is_privileged);

        if is_privileged {
            return match self.ledger.record_message(&message).await? {
                Some(status) => self.resume_or_duplicate(&message, status).await,
                None => {
                    debug!("Privileged admission without reservation");
                    Ok(AdmissionDecision::Admitted {
                        reservation_id: None,
                        lane,
                    })
                }
            };
        }

        match self.strategy.reserve(&message).await? {
            LedgerReserve::Reserved {
                reservation,
                balance_after,
            } => {
                debug!(
                    "Admitted with reservation {} (balance now {})",
                    reservation.id, balance_after
                );
                Ok(AdmissionDecision::Admitted {
                    reservation_id: Some(reservation.id),
                    lane,
                })
            }
            LedgerReserve::Duplicate { status } => self.resume_or_duplicate(&message, status).await,
            LedgerReserve::Insufficient { balance } => {
                message.status = MessageStatus::Rejected;
                if let Some(status) = self.ledger.record_message(&message).await? {
                    return self.resume_or_duplicate(&message, status).await;
                }
                info!("Rejected: balance {} below cost {}", balance, cost);
                Ok(AdmissionDecision::Rejected {
                    reason: AppError::InsufficientFunds {
                        required: cost,
                        available: balance,
                    }
                    .to_string(),
                })
            }
        }
    }

    /// Decide what a resubmitted message id gets.
    ///
    /// A message of the same user that is still `queued` may never have
    /// reached the queue: the ledger commit can land after the client
    /// deadline, or the process can stop between admission and publish. It
    /// is admitted again on its original lane with its existing reservation
    /// so it gets published; settlement skips any extra copy once the
    /// message is terminal. Anything else is reported as a duplicate.
    async fn resume_or_duplicate(
        &self,
        message: &Message,
        status: MessageStatus,
    ) -> AppResult<AdmissionDecision> {
        if status != MessageStatus::Queued {
            return Ok(AdmissionDecision::Duplicate { status });
        }

        match self.ledger.get_message(message.message_id).await? {
            Some(existing)
                if existing.user_id == message.user_id
                    && existing.status == MessageStatus::Queued =>
            {
                // Standard messages always carry their reservation id
                let lane = DispatchRouter::route(existing.reservation_id.is_none());
                info!("Message still queued; admitting again on lane {}", lane);
                Ok(AdmissionDecision::Admitted {
                    reservation_id: existing.reservation_id,
                    lane,
                })
            }
            Some(existing) => Ok(AdmissionDecision::Duplicate {
                status: existing.status,
            }),
            None => Ok(AdmissionDecision::Duplicate { status }),
        }
    }

    /// Tier lookup through the short-lived snapshot cache
    async fn is_privileged(&self, user_id: UserId) -> AppResult<bool> {
        let timeout = self.config.cache_timeout();
        match within(timeout, self.cache.get_user_snapshot(user_id)).await {
            Ok(Some(snapshot)) => return Ok(snapshot.is_privileged),
            Ok(None) => {}
            Err(e) => debug!("Snapshot lookup failed for {}: {}", user_id, e),
        }

        let user = self
            .ledger
            .get_user(user_id)
            .await?
            .ok_or_else(|| AppError::UserNotFound(user_id.to_string()))?;

        let ttl = Duration::from_secs(self.config.user_snapshot_ttl_secs);
        if let Err(e) = within(timeout, self.cache.set_user_snapshot(user_id, user.snapshot(), ttl)).await
        {
            debug!("Could not cache snapshot for {}: {}", user_id, e);
        }
        Ok(user.is_privileged)
    }
}
