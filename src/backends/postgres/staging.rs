use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use super::{PostgresBackend, retry_transient};
use crate::backends::base::{
    BackendError, BackendResult, NewWorkItem, StagingBackend, StagingSummary, WorkItem, WorkItemId,
};
use crate::observability::obs;
use crate::partition::PartitionKey;
use crate::schedule::next_run_at;

#[derive(sqlx::FromRow)]
struct WorkItemRow {
    id: i64,
    entity_id: String,
    location_id: String,
    workflow_id: String,
    field_id: String,
    delay_seconds: i64,
    run_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl From<WorkItemRow> for WorkItem {
    fn from(row: WorkItemRow) -> Self {
        Self {
            id: WorkItemId(row.id),
            entity_id: row.entity_id,
            partition: PartitionKey::new(row.location_id, Some(&row.workflow_id)),
            field_id: row.field_id,
            delay_seconds: row.delay_seconds,
            run_at: row.run_at,
            created_at: row.created_at,
        }
    }
}

impl PostgresBackend {
    /// Stage one item inside a transaction holding the partition's advisory lock.
    #[obs]
    pub async fn stage_work_item_locked(&self, item: &NewWorkItem) -> BackendResult<WorkItem> {
        retry_transient("stage_work_item", || self.stage_work_item_once(item)).await
    }

    async fn stage_work_item_once(&self, item: &NewWorkItem) -> BackendResult<WorkItem> {
        let partition_key = item.partition.as_key();
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(item.partition.lock_id())
            .execute(&mut *tx)
            .await?;

        // clock_timestamp, not NOW(): the clock must be read after the lock wait.
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT MAX(run_at) FROM staged_work_items WHERE partition_key = $1) AS last_run_at,
                clock_timestamp() AS now
            "#,
        )
        .bind(&partition_key)
        .fetch_one(&mut *tx)
        .await?;
        let last_run_at: Option<DateTime<Utc>> = row.get("last_run_at");
        let now: DateTime<Utc> = row.get("now");
        let run_at = next_run_at(last_run_at, now, item.delay_seconds).ok_or_else(|| {
            BackendError::Message(format!(
                "run_at out of range for partition {}",
                item.partition
            ))
        })?;

        let staged = sqlx::query_as::<_, WorkItemRow>(
            r#"
            INSERT INTO staged_work_items
                (entity_id, partition_key, location_id, workflow_id, field_id,
                 delay_seconds, run_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id, entity_id, location_id, workflow_id, field_id,
                      delay_seconds, run_at, created_at
            "#,
        )
        .bind(&item.entity_id)
        .bind(&partition_key)
        .bind(item.partition.location_id())
        .bind(item.partition.workflow_id())
        .bind(&item.field_id)
        .bind(item.delay_seconds)
        .bind(run_at)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(staged.into())
    }

    #[obs]
    pub async fn fetch_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> BackendResult<Vec<WorkItem>> {
        let rows = sqlx::query_as::<_, WorkItemRow>(
            r#"
            SELECT id, entity_id, location_id, workflow_id, field_id,
                   delay_seconds, run_at, created_at
            FROM staged_work_items
            WHERE run_at <= $1
            ORDER BY run_at ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[async_trait]
impl StagingBackend for PostgresBackend {
    async fn stage_work_item(&self, item: &NewWorkItem) -> BackendResult<WorkItem> {
        self.stage_work_item_locked(item).await
    }

    async fn last_run_at(&self, partition: &PartitionKey) -> BackendResult<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT MAX(run_at) AS last_run_at FROM staged_work_items WHERE partition_key = $1",
        )
        .bind(partition.as_key())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("last_run_at"))
    }

    async fn fetch_due_work_items(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> BackendResult<Vec<WorkItem>> {
        self.fetch_due(now, limit).await
    }

    async fn delete_work_item(&self, id: WorkItemId) -> BackendResult<bool> {
        let result = sqlx::query("DELETE FROM staged_work_items WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn discard_delivered(
        &self,
        entity_id: &str,
        partition: &PartitionKey,
        run_at: DateTime<Utc>,
    ) -> BackendResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM staged_work_items
            WHERE entity_id = $1 AND partition_key = $2 AND run_at <= $3
            "#,
        )
        .bind(entity_id)
        .bind(partition.as_key())
        .bind(run_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn recent_partitions(&self, since: DateTime<Utc>) -> BackendResult<Vec<PartitionKey>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT location_id, workflow_id
            FROM staged_work_items
            WHERE created_at >= $1
            ORDER BY location_id, workflow_id
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let location_id: String = row.get("location_id");
                let workflow_id: String = row.get("workflow_id");
                PartitionKey::new(location_id, Some(&workflow_id))
            })
            .collect())
    }

    async fn staging_summary(&self, now: DateTime<Utc>) -> BackendResult<StagingSummary> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS staged,
                   COUNT(*) FILTER (WHERE run_at <= $1) AS due,
                   MIN(run_at) AS next_run_at,
                   COUNT(DISTINCT partition_key) AS partitions
            FROM staged_work_items
            "#,
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(StagingSummary {
            staged: row.get("staged"),
            due: row.get("due"),
            next_run_at: row.get("next_run_at"),
            partitions: row.get("partitions"),
        })
    }
}
