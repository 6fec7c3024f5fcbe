//! Operator reports and manual interventions behind `dripline-admin`.

use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::backends::{BackendResult, StagingBackend, StreamBackend};

/// Upper bound on dead letters scanned for the status count.
pub const DEAD_LETTER_SCAN_LIMIT: usize = 1000;

/// Staging, stream and dead-letter overview for one consumer group.
pub async fn status_report<B>(
    backend: &B,
    group: &str,
    now: DateTime<Utc>,
) -> BackendResult<String>
where
    B: StagingBackend + StreamBackend,
{
    let staging = backend.staging_summary(now).await?;
    let streams = backend.stream_summaries(group).await?;
    let dead_letters = backend.list_dead_letters(DEAD_LETTER_SCAN_LIMIT).await?;

    let mut out = String::new();
    let _ = writeln!(out, "staging:");
    let _ = writeln!(out, "  staged: {}", staging.staged);
    let _ = writeln!(out, "  due: {}", staging.due);
    let _ = writeln!(out, "  partitions: {}", staging.partitions);
    match staging.next_run_at {
        Some(next) => {
            let _ = writeln!(out, "  next run: {}", next.to_rfc3339());
        }
        None => {
            let _ = writeln!(out, "  next run: -");
        }
    }

    let _ = writeln!(out, "streams (group {group}):");
    if streams.is_empty() {
        let _ = writeln!(out, "  none");
    }
    for stream in &streams {
        let oldest = stream
            .oldest_claimed_at
            .map(|at| format!(", oldest claim {}s ago", (now - at).num_seconds().max(0)))
            .unwrap_or_default();
        let _ = writeln!(
            out,
            "  {}: {} messages, {} pending{}",
            stream.stream, stream.length, stream.pending, oldest
        );
    }

    let count = if dead_letters.len() >= DEAD_LETTER_SCAN_LIMIT {
        format!("{DEAD_LETTER_SCAN_LIMIT}+")
    } else {
        dead_letters.len().to_string()
    };
    let _ = writeln!(out, "dead letters: {count}");
    Ok(out)
}

pub async fn dead_letters_report<B>(backend: &B, limit: usize) -> BackendResult<String>
where
    B: StreamBackend,
{
    let dead_letters = backend.list_dead_letters(limit).await?;
    if dead_letters.is_empty() {
        return Ok("no dead letters\n".to_string());
    }
    let mut out = String::new();
    for letter in dead_letters {
        let _ = writeln!(
            out,
            "#{} {} message {} entity {} deliveries {} at {}: {}",
            letter.id,
            letter.stream,
            letter.message_id,
            letter.payload.entity_id,
            letter.delivery_count,
            letter.dead_lettered_at.to_rfc3339(),
            letter.reason
        );
    }
    Ok(out)
}

/// Publish a dead letter again. Returns the message line to print, or `None`
/// when no dead letter has that id.
pub async fn requeue<B>(backend: &B, id: i64) -> BackendResult<Option<String>>
where
    B: StreamBackend,
{
    Ok(backend
        .requeue_dead_letter(id)
        .await?
        .map(|message_id| format!("requeued dead letter #{id} as message {message_id}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{MemoryBackend, NewWorkItem, StreamPayload};
    use crate::partition::PartitionKey;

    async fn dead_lettered(backend: &MemoryBackend) -> String {
        let partition = PartitionKey::new("loc-1", None);
        let stream = partition.stream_name();
        backend
            .publish(
                &stream,
                &StreamPayload {
                    entity_id: "c1".to_string(),
                    partition,
                    field_id: "f1".to_string(),
                    run_at: Utc::now(),
                    enqueued_at: Utc::now(),
                },
            )
            .await
            .expect("publish");
        backend.ensure_group(&stream, "g").await.expect("group");
        let message = backend
            .read_new(&stream, "g", "c")
            .await
            .expect("read")
            .expect("message");
        assert!(
            backend
                .dead_letter(&stream, "g", message.message_id, "gave up")
                .await
                .expect("dead letter")
        );
        stream
    }

    #[tokio::test]
    async fn status_summarizes_every_store() {
        let backend = MemoryBackend::new();
        backend
            .stage_work_item(&NewWorkItem {
                entity_id: "c0".to_string(),
                partition: PartitionKey::new("loc-2", None),
                field_id: "f1".to_string(),
                delay_seconds: 60,
            })
            .await
            .expect("stage");
        dead_lettered(&backend).await;

        let report = status_report(&backend, "g", Utc::now()).await.expect("status");
        assert!(report.contains("staged: 1"), "{report}");
        assert!(report.contains("due: 0"), "{report}");
        assert!(report.contains("dead letters: 1"), "{report}");
        assert!(!report.contains("next run: -"), "{report}");
    }

    #[tokio::test]
    async fn dead_letters_list_and_requeue() {
        let backend = MemoryBackend::new();
        assert_eq!(
            dead_letters_report(&backend, 10).await.expect("empty"),
            "no dead letters\n"
        );

        let stream = dead_lettered(&backend).await;
        let listing = dead_letters_report(&backend, 10).await.expect("listing");
        assert!(listing.contains("entity c1"), "{listing}");
        assert!(listing.contains("gave up"), "{listing}");

        let id = backend.list_dead_letters(1).await.expect("letters")[0].id;
        let line = requeue(&backend, id).await.expect("requeue").expect("found");
        assert!(line.starts_with(&format!("requeued dead letter #{id}")));
        assert_eq!(backend.stream_messages(&stream).len(), 1);
        assert!(requeue(&backend, id).await.expect("requeue again").is_none());
    }
}
