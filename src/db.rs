//! Database helpers shared across services.

use sqlx::PgPool;

use crate::backends::BackendResult;

/// Apply the embedded SQLx migrations.
pub async fn run_migrations(pool: &PgPool) -> BackendResult<()> {
    sqlx::migrate!().run(pool).await?;
    Ok(())
}
