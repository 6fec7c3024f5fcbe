//! Dripline Worker - consumes partition streams and applies downstream updates.
//!
//! Any number of workers may share one consumer group. Configuration is via
//! `DRIPLINE_*` environment variables (see `dripline::config`):
//! - DRIPLINE_DATABASE_URL: PostgreSQL connection string (required)
//! - DRIPLINE_CONSUMER_GROUP / DRIPLINE_CONSUMER_NAME: group membership
//! - DRIPLINE_CLAIM_TIMEOUT_MS: Idle time before a delivery is reclaimed
//! - DRIPLINE_MAX_DELIVERIES: Deliveries before dead-lettering

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{select, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use dripline::{Config, HttpConnector, PostgresBackend, WorkerPool, observability::init_logging};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging("dripline=info,dripline_worker=info");

    let config = Config::from_env()?;
    info!(
        consumer = %config.workers.consumer_name,
        group = %config.workers.group,
        claim_timeout_ms = config.workers.claim_timeout.as_millis(),
        max_deliveries = config.workers.max_deliveries,
        "starting dripline worker"
    );

    let backend = PostgresBackend::connect(&config.database_url, config.db_max_connections)
        .await
        .context("failed to connect to database")?;
    info!("connected to database");

    let updater = Arc::new(
        HttpConnector::new(config.downstream.clone()).context("failed to build http client")?,
    );

    let shutdown_token = CancellationToken::new();
    let shutdown_handle = tokio::spawn({
        let shutdown_token = shutdown_token.clone();
        async move {
            if let Err(err) = wait_for_shutdown().await {
                error!(error = %err, "shutdown signal listener failed");
            } else {
                info!("shutdown signal received - stopping worker");
            }
            shutdown_token.cancel();
        }
    });

    WorkerPool {
        backend: backend.clone(),
        updater,
        config: config.workers.clone(),
    }
    .run(shutdown_token)
    .await;

    let _ = shutdown_handle.await;
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
