//! Ledger pool and schema bootstrap

use smsgate_core::config::DatabaseConfig;
use smsgate_core::{AppError, AppResult};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// Reported as `application_name` on every ledger session
const APPLICATION_NAME: &str = "smsgate";

/// Connections idle longer than this are closed
const IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Open the ledger pool described by `config`.
///
/// The database may still be starting when the gateway boots, so the first
/// connection is retried `connect_attempts` times with a linear backoff.
///
/// ```no_run
/// use smsgate_core::config::DatabaseConfig;
/// use smsgate_db::create_pool;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let pool = create_pool(&DatabaseConfig::default()).await?;
///     Ok(())
/// }
/// ```
pub async fn create_pool(config: &DatabaseConfig) -> AppResult<PgPool> {
    let options = PgConnectOptions::from_str(&config.url)
        .map_err(|e| AppError::Config(format!("Invalid database URL: {}", e)))?
        .application_name(APPLICATION_NAME);

    let attempts = config.connect_attempts.max(1);
    let mut attempt = 1;
    let pool = loop {
        let result = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .idle_timeout(Some(IDLE_TIMEOUT))
            .test_before_acquire(true)
            .connect_with(options.clone())
            .await;

        match result {
            Ok(pool) => break pool,
            Err(e) if attempt < attempts => {
                warn!(
                    "Ledger connection attempt {}/{} failed: {}",
                    attempt, attempts, e
                );
                tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(AppError::Pool(format!(
                    "Failed to connect to ledger after {} attempts: {}",
                    attempts, e
                )))
            }
        }
    };

    info!(
        "Ledger pool ready ({}..={} connections)",
        config.min_connections, config.max_connections
    );
    Ok(pool)
}

/// Apply the embedded ledger migrations
pub async fn run_migrations(pool: &PgPool) -> AppResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| AppError::Database(format!("Migration failed: {}", e)))?;

    info!("Ledger schema is up to date");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_malformed_url() {
        let config = DatabaseConfig {
            url: "not a url".to_string(),
            ..DatabaseConfig::default()
        };

        let err = create_pool(&config).await.unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_create_pool_and_migrate() {
        let mut config = DatabaseConfig::default();
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.url = url;
        }
        config.max_connections = 5;

        let pool = create_pool(&config).await.unwrap();
        run_migrations(&pool).await.unwrap();
    }
}
