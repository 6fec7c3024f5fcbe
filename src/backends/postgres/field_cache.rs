use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::PostgresBackend;
use crate::backends::base::{BackendResult, FieldIdCacheBackend, FieldIdCacheEntry};
use crate::partition::PartitionKey;

#[derive(sqlx::FromRow)]
struct CacheRow {
    field_id: String,
    cached_at: DateTime<Utc>,
}

#[async_trait]
impl FieldIdCacheBackend for PostgresBackend {
    async fn get_field_id(
        &self,
        partition: &PartitionKey,
    ) -> BackendResult<Option<FieldIdCacheEntry>> {
        let row = sqlx::query_as::<_, CacheRow>(
            "SELECT field_id, cached_at FROM field_id_cache WHERE partition_key = $1",
        )
        .bind(partition.as_key())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| FieldIdCacheEntry {
            partition: partition.clone(),
            field_id: row.field_id,
            cached_at: row.cached_at,
        }))
    }

    async fn put_field_id(
        &self,
        partition: &PartitionKey,
        field_id: &str,
    ) -> BackendResult<FieldIdCacheEntry> {
        // The no-op update makes RETURNING yield the stored row on conflict.
        let row = sqlx::query_as::<_, CacheRow>(
            r#"
            INSERT INTO field_id_cache (partition_key, location_id, workflow_id, field_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (partition_key)
            DO UPDATE SET partition_key = field_id_cache.partition_key
            RETURNING field_id, cached_at
            "#,
        )
        .bind(partition.as_key())
        .bind(partition.location_id())
        .bind(partition.workflow_id())
        .bind(field_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(FieldIdCacheEntry {
            partition: partition.clone(),
            field_id: row.field_id,
            cached_at: row.cached_at,
        })
    }
}
