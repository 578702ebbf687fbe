//! smsgate process bootstrap
//!
//! Shared by the `smsgate-server` and `smsgate-worker` binaries: tracing
//! setup and construction of the service graph from [`AppConfig`].

use smsgate_cache::RedisReservationCache;
use smsgate_core::{
    config::LogConfig,
    traits::{LedgerStore, ReservationCache, WorkQueue},
    AppConfig, AppResult,
};
use smsgate_db::{create_pool, run_migrations, PgLedger};
use smsgate_queue::RedisStreamQueue;
use smsgate_services::{
    build_delivery_channel, build_strategy, AdmissionService, DispatchRouter, Gateway,
    ReservationSweeper, RetryPolicy, SettlementProcessor, SettlementWorker,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing/logging
///
/// `RUST_LOG` overrides the filter derived from `log.level`.
pub fn init_tracing(config: &LogConfig) {
    let level = &config.level;
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "smsgate={level},smsgate_api={level},smsgate_services={level},smsgate_db={level},\
             smsgate_cache={level},smsgate_queue={level},actix_web=info,sqlx=warn"
        ))
    });

    let (json, plain) = if config.json {
        (Some(fmt::layer().json().with_current_span(true)), None)
    } else {
        (
            None,
            Some(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true),
            ),
        )
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json)
        .with(plain)
        .init();
}

/// Store, cache and queue handles behind their capability traits
#[derive(Clone)]
pub struct Infrastructure {
    pub ledger: Arc<dyn LedgerStore>,
    pub cache: Arc<dyn ReservationCache>,
    pub queue: Arc<dyn WorkQueue>,
}

impl Infrastructure {
    /// Connect PostgreSQL, the Redis cache and the Redis Streams queue
    pub async fn connect(config: &AppConfig) -> AppResult<Self> {
        info!("Connecting to database...");
        let pool = create_pool(&config.database).await?;
        if config.database.migrate {
            run_migrations(&pool).await?;
        }
        let ledger = PgLedger::new(pool, config.admission.ledger_timeout());

        info!("Connecting to Redis...");
        let cache = RedisReservationCache::new(&config.redis.url).await?;
        let queue = RedisStreamQueue::new(
            config.queue_url(),
            &config.queue.stream_prefix,
            config.queue.partitions,
        )
        .await?;

        Ok(Self {
            ledger: Arc::new(ledger),
            cache: Arc::new(cache),
            queue: Arc::new(queue),
        })
    }

    pub fn gateway(&self, config: &AppConfig) -> Gateway {
        let strategy = build_strategy(&config.admission, self.ledger.clone(), self.cache.clone());
        let admission = AdmissionService::new(
            self.ledger.clone(),
            self.cache.clone(),
            strategy,
            config.admission.clone(),
        );
        let router = DispatchRouter::new(
            self.queue.clone(),
            self.ledger.clone(),
            self.cache.clone(),
            &config.queue,
        );
        Gateway::new(admission, router, self.ledger.clone())
    }

    pub fn sweeper(&self, config: &AppConfig) -> ReservationSweeper {
        ReservationSweeper::new(self.ledger.clone(), self.cache.clone(), &config.sweeper)
    }

    /// Settlement worker for `config.worker.lane`
    pub fn worker(&self, config: &AppConfig) -> AppResult<SettlementWorker> {
        let delivery_timeout = config.worker.delivery_timeout();
        let delivery = build_delivery_channel(&config.delivery, delivery_timeout)?;
        info!("Delivery channel: {}", delivery.name());

        let processor = SettlementProcessor::new(
            self.ledger.clone(),
            delivery,
            RetryPolicy::new(config.admission.ledger_attempts, Duration::from_millis(25)),
            config.admission.reservation_ttl(),
            delivery_timeout,
        );

        Ok(SettlementWorker::new(
            self.queue.clone(),
            Arc::new(processor),
            config.worker.clone(),
            config.queue.lease_ttl(),
        ))
    }
}
