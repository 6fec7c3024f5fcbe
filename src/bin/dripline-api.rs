//! Dripline API - accepts enqueue webhooks and stages work items.
//!
//! Configuration is via `DRIPLINE_*` environment variables (see `dripline::config`):
//! - DRIPLINE_DATABASE_URL: PostgreSQL connection string (required)
//! - DRIPLINE_API_ADDR: Bind address (default: 0.0.0.0:3000)
//! - DRIPLINE_DOWNSTREAM_BASE_URL / DRIPLINE_DOWNSTREAM_API_KEY: field directory access

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{select, signal};
use tracing::info;

use dripline::{
    ApiServer, Config, EnqueueService, HttpConnector, PostgresBackend,
    observability::init_logging,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging("dripline=info,dripline_api=info");

    let config = Config::from_env()?;
    info!(addr = %config.api_addr, "starting dripline api");

    let backend = PostgresBackend::connect(&config.database_url, config.db_max_connections)
        .await
        .context("failed to connect to database")?;
    info!("connected to database");

    let directory = Arc::new(
        HttpConnector::new(config.downstream.clone()).context("failed to build http client")?,
    );
    let service = EnqueueService::new(backend.clone(), directory);
    let server = ApiServer::start(config.api_addr, service).await?;

    wait_for_shutdown().await?;
    info!("shutdown signal received - stopping api");

    server.shutdown().await;
    backend.close().await;

    info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal as unix_signal};

        let mut terminate = unix_signal(SignalKind::terminate())?;
        select! {
            _ = signal::ctrl_c() => {
                info!("Ctrl+C received");
            }
            _ = terminate.recv() => {
                info!("SIGTERM received");
            }
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("Ctrl+C received");
        Ok(())
    }
}
