//! smsgate intake server
//!
//! Serves the HTTP intake surface and runs the reservation sweeper.

use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use smsgate::{init_tracing, Infrastructure};
use smsgate_api::{configure_routes, json_config};
use smsgate_core::AppConfig;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_actix_web::TracingLogger;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("Failed to load configuration")?;
    init_tracing(&config.log);

    info!("Starting smsgate server v{}", env!("CARGO_PKG_VERSION"));

    let infra = Infrastructure::connect(&config)
        .await
        .context("Failed to connect backing services")?;
    let gateway = web::Data::new(infra.gateway(&config));

    let shutdown = CancellationToken::new();
    let sweeper_task = if config.sweeper.enabled {
        let sweeper = Arc::new(infra.sweeper(&config));
        let interval = config.sweeper.interval();
        let token = shutdown.clone();
        Some(tokio::spawn(async move { sweeper.run(interval, token).await }))
    } else {
        info!("Reservation sweeper disabled");
        None
    };

    let bind_addr = config.server_addr();
    info!(
        "Starting HTTP server on {} with {} workers",
        bind_addr, config.server.workers
    );

    HttpServer::new(move || {
        App::new()
            .app_data(gateway.clone())
            .app_data(json_config())
            .wrap(TracingLogger::default())
            .wrap(middleware::Logger::new("%a \"%r\" %s %b %Dms"))
            .wrap(middleware::NormalizePath::trim())
            .configure(configure_routes)
    })
    .workers(config.server.workers)
    .bind(&bind_addr)?
    .run()
    .await?;

    info!("HTTP server stopped");
    shutdown.cancel();
    if let Some(task) = sweeper_task {
        task.await.context("Sweeper task panicked")?;
    }

    Ok(())
}
