//! Backend interfaces for the staging store, field-id cache, and stream broker.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::partition::PartitionKey;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("{0}")]
    Message(String),
    #[error("consumer group {group} does not exist on stream {stream}")]
    MissingGroup { stream: String, group: String },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Identity of a staged work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkItemId(pub i64);

impl fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Broker-assigned message id; strictly increasing within a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// Work item awaiting a run_at assignment.
pub struct NewWorkItem {
    pub entity_id: String,
    pub partition: PartitionKey,
    pub field_id: String,
    pub delay_seconds: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
/// Staged work item. Never mutated after insert.
pub struct WorkItem {
    pub id: WorkItemId,
    pub entity_id: String,
    pub partition: PartitionKey,
    pub field_id: String,
    pub delay_seconds: i64,
    pub run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn to_payload(&self, enqueued_at: DateTime<Utc>) -> StreamPayload {
        StreamPayload {
            entity_id: self.entity_id.clone(),
            partition: self.partition.clone(),
            field_id: self.field_id.clone(),
            run_at: self.run_at,
            enqueued_at,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
/// Body of a stream message.
pub struct StreamPayload {
    pub entity_id: String,
    pub partition: PartitionKey,
    pub field_id: String,
    pub run_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// Message handed to a consumer by `read_new` or `claim`.
pub struct StreamMessage {
    pub stream: String,
    pub message_id: MessageId,
    pub payload: StreamPayload,
    /// Number of times the message has been handed out, including this one.
    pub delivery_count: i32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// Claimed-but-unacknowledged message in a consumer group.
pub struct PendingEntry {
    pub message_id: MessageId,
    pub consumer: String,
    pub claimed_at: DateTime<Utc>,
    pub delivery_count: i32,
}

impl PendingEntry {
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.claimed_at).to_std().unwrap_or(Duration::ZERO)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// Message removed from delivery after exhausting its delivery budget.
pub struct DeadLetter {
    pub id: i64,
    pub stream: String,
    pub group: String,
    pub message_id: MessageId,
    pub payload: StreamPayload,
    pub delivery_count: i32,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldIdCacheEntry {
    pub partition: PartitionKey,
    pub field_id: String,
    pub cached_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
/// Snapshot of the staging store for operators.
pub struct StagingSummary {
    pub staged: i64,
    pub due: i64,
    pub next_run_at: Option<DateTime<Utc>>,
    pub partitions: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// Snapshot of one stream for operators.
pub struct StreamSummary {
    pub stream: String,
    pub length: i64,
    pub pending: i64,
    pub oldest_claimed_at: Option<DateTime<Utc>>,
}

/// Durable store of not-yet-due work.
#[async_trait]
pub trait StagingBackend: Send + Sync {
    /// Assign a run_at under the partition lock and persist the item.
    ///
    /// The lock is held for the whole transaction: read the partition's
    /// latest run_at, chain the new run after it, insert, commit.
    async fn stage_work_item(&self, item: &NewWorkItem) -> BackendResult<WorkItem>;

    /// Latest run_at currently staged for the partition.
    ///
    /// Read-only view for operators and tests. Staging reads the latest
    /// run_at itself while holding the partition lock; never chain off this.
    async fn last_run_at(&self, partition: &PartitionKey) -> BackendResult<Option<DateTime<Utc>>>;

    /// Items due at `now`, ordered by run_at then id.
    async fn fetch_due_work_items(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> BackendResult<Vec<WorkItem>>;

    async fn delete_work_item(&self, id: WorkItemId) -> BackendResult<bool>;

    /// Remove rows for an entity that a consumer already delivered.
    async fn discard_delivered(
        &self,
        entity_id: &str,
        partition: &PartitionKey,
        run_at: DateTime<Utc>,
    ) -> BackendResult<u64>;

    /// Partitions with items staged at or after `since`.
    async fn recent_partitions(&self, since: DateTime<Utc>) -> BackendResult<Vec<PartitionKey>>;

    async fn staging_summary(&self, now: DateTime<Utc>) -> BackendResult<StagingSummary>;
}

/// Durable partition key -> downstream field id cache.
#[async_trait]
pub trait FieldIdCacheBackend: Send + Sync {
    async fn get_field_id(&self, partition: &PartitionKey)
    -> BackendResult<Option<FieldIdCacheEntry>>;

    /// Insert if absent; returns whichever entry is stored afterwards.
    async fn put_field_id(
        &self,
        partition: &PartitionKey,
        field_id: &str,
    ) -> BackendResult<FieldIdCacheEntry>;
}

/// Append log with consumer groups.
///
/// Delivery contract: a group has at most one pending entry per stream.
/// `read_new` returns nothing while the group still has an unacknowledged
/// message on the stream; that message must be acknowledged, reclaimed, or
/// dead-lettered before later messages are handed out.
#[async_trait]
pub trait StreamBackend: Send + Sync {
    async fn publish(&self, stream: &str, payload: &StreamPayload) -> BackendResult<MessageId>;

    /// Streams with retained (unconsumed or pending) messages.
    async fn list_streams(&self) -> BackendResult<Vec<String>>;

    /// Create the group if absent. Idempotent.
    async fn ensure_group(&self, stream: &str, group: &str) -> BackendResult<()>;

    /// Hand the next never-delivered message to `consumer`.
    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> BackendResult<Option<StreamMessage>>;

    /// Pending entries ordered by message id.
    async fn pending(
        &self,
        stream: &str,
        group: &str,
        limit: usize,
    ) -> BackendResult<Vec<PendingEntry>>;

    /// Take over a pending entry idle for at least `min_idle`.
    ///
    /// Returns `None` when the entry is gone or was claimed more recently.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        message_id: MessageId,
        min_idle: Duration,
    ) -> BackendResult<Option<StreamMessage>>;

    /// Acknowledge and garbage-collect messages every group has consumed.
    async fn ack(&self, stream: &str, group: &str, message_id: MessageId) -> BackendResult<bool>;

    /// Move a pending message to the dead-letter list and acknowledge it.
    async fn dead_letter(
        &self,
        stream: &str,
        group: &str,
        message_id: MessageId,
        reason: &str,
    ) -> BackendResult<bool>;

    async fn list_dead_letters(&self, limit: usize) -> BackendResult<Vec<DeadLetter>>;

    /// Publish a dead letter again at the tail of its stream.
    async fn requeue_dead_letter(&self, id: i64) -> BackendResult<Option<MessageId>>;

    async fn stream_summaries(&self, group: &str) -> BackendResult<Vec<StreamSummary>>;
}
