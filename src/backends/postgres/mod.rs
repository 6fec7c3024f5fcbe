//! Postgres backend for the staging store, field-id cache, and stream broker.

mod field_cache;
mod staging;
mod stream;

use std::future::Future;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::warn;

use crate::db;
use crate::observability::obs;

use super::base::{BackendError, BackendResult};

const TRANSIENT_DEADLOCK_SQLSTATE: &str = "40P01";
const TRANSIENT_SERIALIZATION_SQLSTATE: &str = "40001";
const TRANSIENT_RETRY_MAX_ATTEMPTS: usize = 3;
const TRANSIENT_RETRY_INITIAL_BACKOFF_MS: u64 = 25;
const TRANSIENT_RETRY_MAX_BACKOFF_MS: u64 = 250;

/// Persist staged work, cached field ids, and streams in Postgres.
#[derive(Clone)]
pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool and apply pending migrations.
    #[obs]
    pub async fn connect(dsn: &str, max_connections: u32) -> BackendResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(dsn)
            .await?;
        db::run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Delete every row this backend owns. Test helper.
    #[obs]
    pub async fn clear_all(&self) -> BackendResult<()> {
        sqlx::query(
            r#"
            TRUNCATE staged_work_items,
                     field_id_cache,
                     stream_dead_letters,
                     stream_pending_entries,
                     stream_consumer_groups,
                     stream_messages,
                     streams
            RESTART IDENTITY
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn is_transient_sqlstate(code: &str) -> bool {
    matches!(
        code,
        TRANSIENT_DEADLOCK_SQLSTATE | TRANSIENT_SERIALIZATION_SQLSTATE
    )
}

pub(crate) fn is_transient_backend_error(err: &BackendError) -> bool {
    match err {
        BackendError::Sqlx(sqlx::Error::Database(db_err)) => {
            db_err.code().as_deref().is_some_and(is_transient_sqlstate)
        }
        BackendError::Message(message) => {
            message.contains("deadlock detected")
                || message.contains("could not serialize access due to")
        }
        _ => false,
    }
}

/// Re-run `op` on deadlock or serialization failure with capped backoff.
async fn retry_transient<T, Op, Fut>(operation: &'static str, mut op: Op) -> BackendResult<T>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = BackendResult<T>>,
{
    let mut attempt = 0usize;
    let mut backoff_ms = TRANSIENT_RETRY_INITIAL_BACKOFF_MS;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err)
                if attempt < TRANSIENT_RETRY_MAX_ATTEMPTS && is_transient_backend_error(&err) =>
            {
                attempt += 1;
                warn!(
                    operation,
                    attempt,
                    error = %err,
                    "transient database error; retrying"
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = backoff_ms
                    .saturating_mul(2)
                    .min(TRANSIENT_RETRY_MAX_BACKOFF_MS);
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn recognizes_transient_messages() {
        assert!(is_transient_backend_error(&BackendError::Message(
            "ERROR: deadlock detected".to_string()
        )));
        assert!(!is_transient_backend_error(&BackendError::Message(
            "relation does not exist".to_string()
        )));
        assert!(!is_transient_backend_error(&BackendError::MissingGroup {
            stream: "s".to_string(),
            group: "g".to_string(),
        }));
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let calls = AtomicUsize::new(0);
        let result = retry_transient("test", || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(BackendError::Message("deadlock detected".to_string()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await
        .expect("eventually succeeds");
        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_bounded_attempts() {
        let calls = AtomicUsize::new(0);
        let result: BackendResult<()> = retry_transient("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BackendError::Message("deadlock detected".to_string())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), TRANSIENT_RETRY_MAX_ATTEMPTS + 1);
    }

    #[tokio::test]
    async fn does_not_retry_permanent_errors() {
        let calls = AtomicUsize::new(0);
        let result: BackendResult<()> = retry_transient("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BackendError::Message("boom".to_string())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
