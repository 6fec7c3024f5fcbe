use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering},
};
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::base::{
    BackendError, BackendResult, DeadLetter, FieldIdCacheBackend, FieldIdCacheEntry, MessageId,
    NewWorkItem, PendingEntry, StagingBackend, StagingSummary, StreamBackend, StreamMessage,
    StreamPayload, StreamSummary, WorkItem, WorkItemId,
};
use super::memory::MemoryBackend;
use crate::partition::PartitionKey;

/// Memory backend wrapper that fails selected calls on demand.
#[derive(Clone)]
pub struct FaultInjectingBackend {
    inner: MemoryBackend,
    fail_publish: Arc<AtomicBool>,
    fail_delete: Arc<AtomicBool>,
    fail_ack: Arc<AtomicBool>,
    publish_failures: Arc<AtomicUsize>,
    publish_calls: Arc<AtomicUsize>,
    delete_calls: Arc<AtomicUsize>,
}

impl FaultInjectingBackend {
    pub fn new(inner: MemoryBackend) -> Self {
        Self {
            inner,
            fail_publish: Arc::new(AtomicBool::new(false)),
            fail_delete: Arc::new(AtomicBool::new(false)),
            fail_ack: Arc::new(AtomicBool::new(false)),
            publish_failures: Arc::new(AtomicUsize::new(0)),
            publish_calls: Arc::new(AtomicUsize::new(0)),
            delete_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn inner(&self) -> &MemoryBackend {
        &self.inner
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, AtomicOrdering::SeqCst);
    }

    /// Fail only the next `count` publishes.
    pub fn fail_next_publishes(&self, count: usize) {
        self.publish_failures.store(count, AtomicOrdering::SeqCst);
    }

    pub fn set_fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, AtomicOrdering::SeqCst);
    }

    pub fn set_fail_ack(&self, fail: bool) {
        self.fail_ack.store(fail, AtomicOrdering::SeqCst);
    }

    pub fn publish_calls(&self) -> usize {
        self.publish_calls.load(AtomicOrdering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(AtomicOrdering::SeqCst)
    }

    fn injected(flag: &AtomicBool, what: &str) -> BackendResult<()> {
        if flag.load(AtomicOrdering::SeqCst) {
            return Err(BackendError::Message(format!("injected {what} failure")));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl StagingBackend for FaultInjectingBackend {
    async fn stage_work_item(&self, item: &NewWorkItem) -> BackendResult<WorkItem> {
        self.inner.stage_work_item(item).await
    }

    async fn last_run_at(&self, partition: &PartitionKey) -> BackendResult<Option<DateTime<Utc>>> {
        self.inner.last_run_at(partition).await
    }

    async fn fetch_due_work_items(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> BackendResult<Vec<WorkItem>> {
        self.inner.fetch_due_work_items(now, limit).await
    }

    async fn delete_work_item(&self, id: WorkItemId) -> BackendResult<bool> {
        self.delete_calls.fetch_add(1, AtomicOrdering::SeqCst);
        Self::injected(&self.fail_delete, "delete")?;
        self.inner.delete_work_item(id).await
    }

    async fn discard_delivered(
        &self,
        entity_id: &str,
        partition: &PartitionKey,
        run_at: DateTime<Utc>,
    ) -> BackendResult<u64> {
        self.inner
            .discard_delivered(entity_id, partition, run_at)
            .await
    }

    async fn recent_partitions(&self, since: DateTime<Utc>) -> BackendResult<Vec<PartitionKey>> {
        self.inner.recent_partitions(since).await
    }

    async fn staging_summary(&self, now: DateTime<Utc>) -> BackendResult<StagingSummary> {
        self.inner.staging_summary(now).await
    }
}

#[async_trait::async_trait]
impl FieldIdCacheBackend for FaultInjectingBackend {
    async fn get_field_id(
        &self,
        partition: &PartitionKey,
    ) -> BackendResult<Option<FieldIdCacheEntry>> {
        self.inner.get_field_id(partition).await
    }

    async fn put_field_id(
        &self,
        partition: &PartitionKey,
        field_id: &str,
    ) -> BackendResult<FieldIdCacheEntry> {
        self.inner.put_field_id(partition, field_id).await
    }
}

#[async_trait::async_trait]
impl StreamBackend for FaultInjectingBackend {
    async fn publish(&self, stream: &str, payload: &StreamPayload) -> BackendResult<MessageId> {
        self.publish_calls.fetch_add(1, AtomicOrdering::SeqCst);
        Self::injected(&self.fail_publish, "publish")?;
        let remaining = self.publish_failures.fetch_update(
            AtomicOrdering::SeqCst,
            AtomicOrdering::SeqCst,
            |left| left.checked_sub(1),
        );
        if remaining.is_ok() {
            return Err(BackendError::Message("injected publish failure".to_string()));
        }
        self.inner.publish(stream, payload).await
    }

    async fn list_streams(&self) -> BackendResult<Vec<String>> {
        self.inner.list_streams().await
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> BackendResult<()> {
        self.inner.ensure_group(stream, group).await
    }

    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> BackendResult<Option<StreamMessage>> {
        self.inner.read_new(stream, group, consumer).await
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        limit: usize,
    ) -> BackendResult<Vec<PendingEntry>> {
        self.inner.pending(stream, group, limit).await
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        message_id: MessageId,
        min_idle: Duration,
    ) -> BackendResult<Option<StreamMessage>> {
        self.inner
            .claim(stream, group, consumer, message_id, min_idle)
            .await
    }

    async fn ack(&self, stream: &str, group: &str, message_id: MessageId) -> BackendResult<bool> {
        Self::injected(&self.fail_ack, "ack")?;
        self.inner.ack(stream, group, message_id).await
    }

    async fn dead_letter(
        &self,
        stream: &str,
        group: &str,
        message_id: MessageId,
        reason: &str,
    ) -> BackendResult<bool> {
        self.inner
            .dead_letter(stream, group, message_id, reason)
            .await
    }

    async fn list_dead_letters(&self, limit: usize) -> BackendResult<Vec<DeadLetter>> {
        self.inner.list_dead_letters(limit).await
    }

    async fn requeue_dead_letter(&self, id: i64) -> BackendResult<Option<MessageId>> {
        self.inner.requeue_dead_letter(id).await
    }

    async fn stream_summaries(&self, group: &str) -> BackendResult<Vec<StreamSummary>> {
        self.inner.stream_summaries(group).await
    }
}
