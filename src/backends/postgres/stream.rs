use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Row, Transaction};

use super::PostgresBackend;
use crate::backends::base::{
    BackendError, BackendResult, DeadLetter, MessageId, PendingEntry, StreamBackend,
    StreamMessage, StreamPayload, StreamSummary,
};
use crate::observability::obs;

#[derive(sqlx::FromRow)]
struct PendingRow {
    message_id: i64,
    consumer: String,
    claimed_at: DateTime<Utc>,
    delivery_count: i32,
}

#[derive(sqlx::FromRow)]
struct DeadLetterRow {
    id: i64,
    stream: String,
    group_name: String,
    message_id: i64,
    payload: serde_json::Value,
    delivery_count: i32,
    reason: String,
    dead_lettered_at: DateTime<Utc>,
}

impl TryFrom<DeadLetterRow> for DeadLetter {
    type Error = BackendError;

    fn try_from(row: DeadLetterRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            stream: row.stream,
            group: row.group_name,
            message_id: MessageId(row.message_id),
            payload: serde_json::from_value(row.payload)?,
            delivery_count: row.delivery_count,
            reason: row.reason,
            dead_lettered_at: row.dead_lettered_at,
        })
    }
}

/// Append to a stream. The `streams` row lock orders concurrent publishers.
async fn append_message(
    tx: &mut Transaction<'_, Postgres>,
    stream: &str,
    payload: &serde_json::Value,
) -> BackendResult<MessageId> {
    let row = sqlx::query(
        r#"
        INSERT INTO streams (name, last_seq)
        VALUES ($1, 1)
        ON CONFLICT (name) DO UPDATE SET last_seq = streams.last_seq + 1
        RETURNING last_seq
        "#,
    )
    .bind(stream)
    .fetch_one(&mut **tx)
    .await?;
    let message_id: i64 = row.get("last_seq");

    sqlx::query("INSERT INTO stream_messages (stream, message_id, payload) VALUES ($1, $2, $3)")
        .bind(stream)
        .bind(message_id)
        .bind(payload)
        .execute(&mut **tx)
        .await?;
    Ok(MessageId(message_id))
}

/// Drop messages every group has read and none still holds pending.
async fn collect_consumed(tx: &mut Transaction<'_, Postgres>, stream: &str) -> BackendResult<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM stream_messages m
        WHERE m.stream = $1
          AND m.message_id <= (
              SELECT MIN(last_delivered_id) FROM stream_consumer_groups WHERE stream = $1
          )
          AND NOT EXISTS (
              SELECT 1 FROM stream_pending_entries p
              WHERE p.stream = $1 AND p.message_id = m.message_id
          )
        "#,
    )
    .bind(stream)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected())
}

impl PostgresBackend {
    #[obs]
    pub async fn read_next_for_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> BackendResult<Option<StreamMessage>> {
        let mut tx = self.pool.begin().await?;

        let cursor = sqlx::query(
            r#"
            SELECT last_delivered_id
            FROM stream_consumer_groups
            WHERE stream = $1 AND group_name = $2
            FOR UPDATE
            "#,
        )
        .bind(stream)
        .bind(group)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| BackendError::MissingGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        })?;
        let last_delivered: i64 = cursor.get("last_delivered_id");

        let has_pending: bool = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM stream_pending_entries WHERE stream = $1 AND group_name = $2
            ) AS has_pending
            "#,
        )
        .bind(stream)
        .bind(group)
        .fetch_one(&mut *tx)
        .await?
        .get("has_pending");
        if has_pending {
            tx.commit().await?;
            return Ok(None);
        }

        let Some(next) = sqlx::query(
            r#"
            SELECT message_id, payload
            FROM stream_messages
            WHERE stream = $1 AND message_id > $2
            ORDER BY message_id ASC
            LIMIT 1
            "#,
        )
        .bind(stream)
        .bind(last_delivered)
        .fetch_optional(&mut *tx)
        .await?
        else {
            tx.commit().await?;
            return Ok(None);
        };
        let message_id: i64 = next.get("message_id");
        let payload: serde_json::Value = next.get("payload");

        sqlx::query(
            r#"
            INSERT INTO stream_pending_entries (stream, group_name, message_id, consumer, claimed_at)
            VALUES ($1, $2, $3, $4, clock_timestamp())
            "#,
        )
        .bind(stream)
        .bind(group)
        .bind(message_id)
        .bind(consumer)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r#"
            UPDATE stream_consumer_groups
            SET last_delivered_id = $3
            WHERE stream = $1 AND group_name = $2
            "#,
        )
        .bind(stream)
        .bind(group)
        .bind(message_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(Some(StreamMessage {
            stream: stream.to_string(),
            message_id: MessageId(message_id),
            payload: serde_json::from_value(payload)?,
            delivery_count: 1,
        }))
    }

    #[obs]
    pub async fn claim_idle_entry(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        message_id: MessageId,
        min_idle: Duration,
    ) -> BackendResult<Option<StreamMessage>> {
        let row = sqlx::query(
            r#"
            WITH claimed AS (
                UPDATE stream_pending_entries
                SET consumer = $3,
                    claimed_at = clock_timestamp(),
                    delivery_count = delivery_count + 1
                WHERE stream = $1
                  AND group_name = $2
                  AND message_id = $4
                  AND claimed_at <= clock_timestamp() - make_interval(secs => $5)
                RETURNING message_id, delivery_count
            )
            SELECT claimed.message_id, claimed.delivery_count, m.payload
            FROM claimed
            JOIN stream_messages m ON m.stream = $1 AND m.message_id = claimed.message_id
            "#,
        )
        .bind(stream)
        .bind(group)
        .bind(consumer)
        .bind(message_id.0)
        .bind(min_idle.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let payload: serde_json::Value = row.get("payload");
        Ok(Some(StreamMessage {
            stream: stream.to_string(),
            message_id,
            payload: serde_json::from_value(payload)?,
            delivery_count: row.get("delivery_count"),
        }))
    }

    #[obs]
    pub async fn move_to_dead_letters(
        &self,
        stream: &str,
        group: &str,
        message_id: MessageId,
        reason: &str,
    ) -> BackendResult<bool> {
        let mut tx = self.pool.begin().await?;
        let Some(pending) = sqlx::query(
            r#"
            DELETE FROM stream_pending_entries
            WHERE stream = $1 AND group_name = $2 AND message_id = $3
            RETURNING delivery_count
            "#,
        )
        .bind(stream)
        .bind(group)
        .bind(message_id.0)
        .fetch_optional(&mut *tx)
        .await?
        else {
            tx.rollback().await?;
            return Ok(false);
        };
        let delivery_count: i32 = pending.get("delivery_count");

        let inserted = sqlx::query(
            r#"
            INSERT INTO stream_dead_letters
                (stream, group_name, message_id, payload, delivery_count, reason)
            SELECT stream, $2, message_id, payload, $4, $5
            FROM stream_messages
            WHERE stream = $1 AND message_id = $3
            "#,
        )
        .bind(stream)
        .bind(group)
        .bind(message_id.0)
        .bind(delivery_count)
        .bind(reason)
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        collect_consumed(&mut tx, stream).await?;
        tx.commit().await?;
        Ok(true)
    }
}

#[async_trait]
impl StreamBackend for PostgresBackend {
    async fn publish(&self, stream: &str, payload: &StreamPayload) -> BackendResult<MessageId> {
        let payload = serde_json::to_value(payload)?;
        let mut tx = self.pool.begin().await?;
        let id = append_message(&mut tx, stream, &payload).await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn list_streams(&self) -> BackendResult<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT stream FROM stream_messages ORDER BY stream")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|row| row.get("stream")).collect())
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> BackendResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO streams (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
            .bind(stream)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO stream_consumer_groups (stream, group_name)
            VALUES ($1, $2)
            ON CONFLICT (stream, group_name) DO NOTHING
            "#,
        )
        .bind(stream)
        .bind(group)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> BackendResult<Option<StreamMessage>> {
        self.read_next_for_group(stream, group, consumer).await
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        limit: usize,
    ) -> BackendResult<Vec<PendingEntry>> {
        let rows = sqlx::query_as::<_, PendingRow>(
            r#"
            SELECT message_id, consumer, claimed_at, delivery_count
            FROM stream_pending_entries
            WHERE stream = $1 AND group_name = $2
            ORDER BY message_id ASC
            LIMIT $3
            "#,
        )
        .bind(stream)
        .bind(group)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| PendingEntry {
                message_id: MessageId(row.message_id),
                consumer: row.consumer,
                claimed_at: row.claimed_at,
                delivery_count: row.delivery_count,
            })
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        message_id: MessageId,
        min_idle: Duration,
    ) -> BackendResult<Option<StreamMessage>> {
        self.claim_idle_entry(stream, group, consumer, message_id, min_idle)
            .await
    }

    async fn ack(&self, stream: &str, group: &str, message_id: MessageId) -> BackendResult<bool> {
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query(
            r#"
            DELETE FROM stream_pending_entries
            WHERE stream = $1 AND group_name = $2 AND message_id = $3
            "#,
        )
        .bind(stream)
        .bind(group)
        .bind(message_id.0)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        collect_consumed(&mut tx, stream).await?;
        tx.commit().await?;
        Ok(removed > 0)
    }

    async fn dead_letter(
        &self,
        stream: &str,
        group: &str,
        message_id: MessageId,
        reason: &str,
    ) -> BackendResult<bool> {
        self.move_to_dead_letters(stream, group, message_id, reason)
            .await
    }

    async fn list_dead_letters(&self, limit: usize) -> BackendResult<Vec<DeadLetter>> {
        let rows = sqlx::query_as::<_, DeadLetterRow>(
            r#"
            SELECT id, stream, group_name, message_id, payload, delivery_count, reason,
                   dead_lettered_at
            FROM stream_dead_letters
            ORDER BY id ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(DeadLetter::try_from).collect()
    }

    async fn requeue_dead_letter(&self, id: i64) -> BackendResult<Option<MessageId>> {
        let mut tx = self.pool.begin().await?;
        let Some(row) = sqlx::query(
            "DELETE FROM stream_dead_letters WHERE id = $1 RETURNING stream, payload",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        else {
            tx.rollback().await?;
            return Ok(None);
        };
        let stream: String = row.get("stream");
        let payload: serde_json::Value = row.get("payload");
        let message_id = append_message(&mut tx, &stream, &payload).await?;
        tx.commit().await?;
        Ok(Some(message_id))
    }

    async fn stream_summaries(&self, group: &str) -> BackendResult<Vec<StreamSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT m.stream,
                   COUNT(*) AS length,
                   (SELECT COUNT(*) FROM stream_pending_entries p
                    WHERE p.stream = m.stream AND p.group_name = $1) AS pending,
                   (SELECT MIN(p.claimed_at) FROM stream_pending_entries p
                    WHERE p.stream = m.stream AND p.group_name = $1) AS oldest_claimed_at
            FROM stream_messages m
            GROUP BY m.stream
            ORDER BY m.stream
            "#,
        )
        .bind(group)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| StreamSummary {
                stream: row.get("stream"),
                length: row.get("length"),
                pending: row.get("pending"),
                oldest_claimed_at: row.get("oldest_claimed_at"),
            })
            .collect())
    }
}
