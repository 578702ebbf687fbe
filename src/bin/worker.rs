//! smsgate settlement worker
//!
//! Consumes one lane. The lane comes from `worker.lane` or the first
//! command-line argument (`privileged` / `standard`).

use anyhow::{bail, Context};
use smsgate::{init_tracing, Infrastructure};
use smsgate_core::{models::Lane, AppConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config = AppConfig::load().context("Failed to load configuration")?;
    if let Some(arg) = std::env::args().nth(1) {
        match Lane::from_str(&arg) {
            Some(lane) => config.worker.lane = lane,
            None => bail!("Unknown lane '{}', expected privileged or standard", arg),
        }
    }
    init_tracing(&config.log);

    info!(
        "Starting smsgate worker v{} for lane {}",
        env!("CARGO_PKG_VERSION"),
        config.worker.lane
    );

    let infra = Infrastructure::connect(&config)
        .await
        .context("Failed to connect backing services")?;
    let worker = infra.worker(&config)?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Shutdown signal received");
        signal.cancel();
    });

    worker.run(shutdown).await?;
    Ok(())
}
