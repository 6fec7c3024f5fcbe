//! Dripline Promoter - moves due staged work items onto partition streams.
//!
//! Run a single promoter per deployment. Configuration is via `DRIPLINE_*`
//! environment variables (see `dripline::config`):
//! - DRIPLINE_DATABASE_URL: PostgreSQL connection string (required)
//! - DRIPLINE_PROMOTER_POLL_INTERVAL_MS: Poll interval (default: 1000)
//! - DRIPLINE_PROMOTER_BATCH_SIZE: Items promoted per pass (default: 50)

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::{select, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use dripline::{Config, PostgresBackend, PromoterTask, observability::init_logging};

const PROMOTER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    init_logging("dripline=info,dripline_promoter=info");

    let config = Config::from_env()?;
    info!(
        poll_interval_ms = config.promoter.poll_interval.as_millis(),
        batch_size = config.promoter.batch_size,
        "starting dripline promoter"
    );

    let backend = PostgresBackend::connect(&config.database_url, config.db_max_connections)
        .await
        .context("failed to connect to database")?;
    info!("connected to database");

    let shutdown_token = CancellationToken::new();
    let promoter = PromoterTask {
        backend: backend.clone(),
        config: config.promoter.clone(),
    };
    let promoter_handle = tokio::spawn(promoter.run(shutdown_token.clone().cancelled_owned()));

    wait_for_shutdown().await?;
    info!("shutdown signal received - stopping promoter");
    shutdown_token.cancel();

    match tokio::time::timeout(PROMOTER_SHUTDOWN_TIMEOUT, promoter_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(error = ?err, "promoter task panicked"),
        Err(_) => warn!("timed out waiting for promoter"),
    }
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
