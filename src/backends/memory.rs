//! In-memory backend for tests and local runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::base::{
    BackendError, BackendResult, DeadLetter, FieldIdCacheBackend, FieldIdCacheEntry, MessageId,
    NewWorkItem, PendingEntry, StagingBackend, StagingSummary, StreamBackend, StreamMessage,
    StreamPayload, StreamSummary, WorkItem, WorkItemId,
};
use crate::partition::PartitionKey;
use crate::schedule::next_run_at;

type PartitionLockStore = HashMap<String, Arc<tokio::sync::Mutex<()>>>;

#[derive(Default)]
struct StagingState {
    next_id: i64,
    items: Vec<WorkItem>,
}

#[derive(Default)]
struct MemoryGroup {
    last_delivered: i64,
    pending: BTreeMap<i64, PendingEntry>,
}

#[derive(Default)]
struct MemoryStream {
    next_id: i64,
    messages: BTreeMap<i64, StreamPayload>,
    groups: HashMap<String, MemoryGroup>,
}

impl MemoryStream {
    fn append(&mut self, payload: StreamPayload) -> MessageId {
        self.next_id += 1;
        self.messages.insert(self.next_id, payload);
        MessageId(self.next_id)
    }

    fn collect_consumed(&mut self) {
        let Some(floor) = self.groups.values().map(|group| group.last_delivered).min() else {
            return;
        };
        let groups = &self.groups;
        self.messages.retain(|id, _| {
            *id > floor || groups.values().any(|group| group.pending.contains_key(id))
        });
    }
}

#[derive(Default)]
struct DeadLetterState {
    next_id: i64,
    entries: Vec<DeadLetter>,
}

/// Backend that keeps staging, cache, and stream state in process memory.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    staging: Arc<Mutex<StagingState>>,
    partition_locks: Arc<Mutex<PartitionLockStore>>,
    field_ids: Arc<Mutex<HashMap<PartitionKey, FieldIdCacheEntry>>>,
    streams: Arc<Mutex<BTreeMap<String, MemoryStream>>>,
    dead_letters: Arc<Mutex<DeadLetterState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn staged_items(&self) -> Vec<WorkItem> {
        self.staging
            .lock()
            .expect("staging poisoned")
            .items
            .clone()
    }

    pub fn stream_messages(&self, stream: &str) -> Vec<(MessageId, StreamPayload)> {
        let streams = self.streams.lock().expect("streams poisoned");
        streams
            .get(stream)
            .map(|entry| {
                entry
                    .messages
                    .iter()
                    .map(|(id, payload)| (MessageId(*id), payload.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn cached_field_ids(&self) -> Vec<FieldIdCacheEntry> {
        self.field_ids
            .lock()
            .expect("field ids poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Rewind a pending entry's claim time, as if its owner stalled.
    pub fn age_pending_entry(
        &self,
        stream: &str,
        group: &str,
        message_id: MessageId,
        by: Duration,
    ) -> bool {
        let mut streams = self.streams.lock().expect("streams poisoned");
        let Some(entry) = streams
            .get_mut(stream)
            .and_then(|entry| entry.groups.get_mut(group))
            .and_then(|group| group.pending.get_mut(&message_id.0))
        else {
            return false;
        };
        let by = chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
        entry.claimed_at -= by;
        true
    }

    fn partition_lock(&self, partition: &PartitionKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.partition_locks.lock().expect("partition locks poisoned");
        locks
            .entry(partition.as_key())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop the partition's lock entry once nothing else holds or awaits it.
    fn release_partition_lock(
        &self,
        partition: &PartitionKey,
        lock: Arc<tokio::sync::Mutex<()>>,
    ) {
        let mut locks = self.partition_locks.lock().expect("partition locks poisoned");
        // One reference in the map, one here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&partition.as_key());
        }
    }

    async fn stage_locked(&self, item: &NewWorkItem) -> BackendResult<WorkItem> {
        let last_run_at = self.latest_run_at(&item.partition);
        // A transaction would suspend between the read and the insert.
        tokio::task::yield_now().await;
        let now = Utc::now();
        let run_at = next_run_at(last_run_at, now, item.delay_seconds).ok_or_else(|| {
            BackendError::Message(format!(
                "run_at out of range for partition {}",
                item.partition
            ))
        })?;

        let mut staging = self.staging.lock().expect("staging poisoned");
        staging.next_id += 1;
        let staged = WorkItem {
            id: WorkItemId(staging.next_id),
            entity_id: item.entity_id.clone(),
            partition: item.partition.clone(),
            field_id: item.field_id.clone(),
            delay_seconds: item.delay_seconds,
            run_at,
            created_at: now,
        };
        staging.items.push(staged.clone());
        Ok(staged)
    }

    pub fn partition_lock_count(&self) -> usize {
        self.partition_locks
            .lock()
            .expect("partition locks poisoned")
            .len()
    }

    fn latest_run_at(&self, partition: &PartitionKey) -> Option<DateTime<Utc>> {
        let staging = self.staging.lock().expect("staging poisoned");
        staging
            .items
            .iter()
            .filter(|item| &item.partition == partition)
            .map(|item| item.run_at)
            .max()
    }

    fn publish_locked(
        streams: &mut BTreeMap<String, MemoryStream>,
        stream: &str,
        payload: StreamPayload,
    ) -> MessageId {
        streams.entry(stream.to_string()).or_default().append(payload)
    }
}

#[async_trait]
impl StagingBackend for MemoryBackend {
    async fn stage_work_item(&self, item: &NewWorkItem) -> BackendResult<WorkItem> {
        let lock = self.partition_lock(&item.partition);
        let staged = {
            let _held = lock.lock().await;
            self.stage_locked(item).await
        };
        self.release_partition_lock(&item.partition, lock);
        staged
    }

    async fn last_run_at(&self, partition: &PartitionKey) -> BackendResult<Option<DateTime<Utc>>> {
        Ok(self.latest_run_at(partition))
    }

    async fn fetch_due_work_items(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> BackendResult<Vec<WorkItem>> {
        let staging = self.staging.lock().expect("staging poisoned");
        let mut due: Vec<WorkItem> = staging
            .items
            .iter()
            .filter(|item| item.run_at <= now)
            .cloned()
            .collect();
        due.sort_by(|left, right| (left.run_at, left.id).cmp(&(right.run_at, right.id)));
        due.truncate(limit);
        Ok(due)
    }

    async fn delete_work_item(&self, id: WorkItemId) -> BackendResult<bool> {
        let mut staging = self.staging.lock().expect("staging poisoned");
        let before = staging.items.len();
        staging.items.retain(|item| item.id != id);
        Ok(staging.items.len() < before)
    }

    async fn discard_delivered(
        &self,
        entity_id: &str,
        partition: &PartitionKey,
        run_at: DateTime<Utc>,
    ) -> BackendResult<u64> {
        let mut staging = self.staging.lock().expect("staging poisoned");
        let before = staging.items.len();
        staging.items.retain(|item| {
            !(item.entity_id == entity_id && &item.partition == partition && item.run_at <= run_at)
        });
        Ok((before - staging.items.len()) as u64)
    }

    async fn recent_partitions(&self, since: DateTime<Utc>) -> BackendResult<Vec<PartitionKey>> {
        let staging = self.staging.lock().expect("staging poisoned");
        let mut partitions: Vec<PartitionKey> = staging
            .items
            .iter()
            .filter(|item| item.created_at >= since)
            .map(|item| item.partition.clone())
            .collect();
        partitions.sort();
        partitions.dedup();
        Ok(partitions)
    }

    async fn staging_summary(&self, now: DateTime<Utc>) -> BackendResult<StagingSummary> {
        let staging = self.staging.lock().expect("staging poisoned");
        let mut partitions: Vec<&PartitionKey> =
            staging.items.iter().map(|item| &item.partition).collect();
        partitions.sort();
        partitions.dedup();
        Ok(StagingSummary {
            staged: staging.items.len() as i64,
            due: staging.items.iter().filter(|item| item.run_at <= now).count() as i64,
            next_run_at: staging.items.iter().map(|item| item.run_at).min(),
            partitions: partitions.len() as i64,
        })
    }
}

#[async_trait]
impl FieldIdCacheBackend for MemoryBackend {
    async fn get_field_id(
        &self,
        partition: &PartitionKey,
    ) -> BackendResult<Option<FieldIdCacheEntry>> {
        let cache = self.field_ids.lock().expect("field ids poisoned");
        Ok(cache.get(partition).cloned())
    }

    async fn put_field_id(
        &self,
        partition: &PartitionKey,
        field_id: &str,
    ) -> BackendResult<FieldIdCacheEntry> {
        let mut cache = self.field_ids.lock().expect("field ids poisoned");
        let entry = cache
            .entry(partition.clone())
            .or_insert_with(|| FieldIdCacheEntry {
                partition: partition.clone(),
                field_id: field_id.to_string(),
                cached_at: Utc::now(),
            });
        Ok(entry.clone())
    }
}

#[async_trait]
impl StreamBackend for MemoryBackend {
    async fn publish(&self, stream: &str, payload: &StreamPayload) -> BackendResult<MessageId> {
        let mut streams = self.streams.lock().expect("streams poisoned");
        Ok(Self::publish_locked(&mut streams, stream, payload.clone()))
    }

    async fn list_streams(&self) -> BackendResult<Vec<String>> {
        let streams = self.streams.lock().expect("streams poisoned");
        Ok(streams
            .iter()
            .filter(|(_, entry)| !entry.messages.is_empty())
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> BackendResult<()> {
        let mut streams = self.streams.lock().expect("streams poisoned");
        streams
            .entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> BackendResult<Option<StreamMessage>> {
        let mut streams = self.streams.lock().expect("streams poisoned");
        let missing_group = || BackendError::MissingGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        };
        let entry = streams.get_mut(stream).ok_or_else(missing_group)?;
        let state = entry.groups.get_mut(group).ok_or_else(missing_group)?;
        if !state.pending.is_empty() {
            return Ok(None);
        }
        let Some((id, payload)) = entry
            .messages
            .range(state.last_delivered + 1..)
            .next()
            .map(|(id, payload)| (*id, payload.clone()))
        else {
            return Ok(None);
        };
        state.last_delivered = id;
        state.pending.insert(
            id,
            PendingEntry {
                message_id: MessageId(id),
                consumer: consumer.to_string(),
                claimed_at: Utc::now(),
                delivery_count: 1,
            },
        );
        Ok(Some(StreamMessage {
            stream: stream.to_string(),
            message_id: MessageId(id),
            payload,
            delivery_count: 1,
        }))
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        limit: usize,
    ) -> BackendResult<Vec<PendingEntry>> {
        let streams = self.streams.lock().expect("streams poisoned");
        Ok(streams
            .get(stream)
            .and_then(|entry| entry.groups.get(group))
            .map(|state| state.pending.values().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        message_id: MessageId,
        min_idle: Duration,
    ) -> BackendResult<Option<StreamMessage>> {
        let mut streams = self.streams.lock().expect("streams poisoned");
        let Some(entry) = streams.get_mut(stream) else {
            return Ok(None);
        };
        let Some(payload) = entry.messages.get(&message_id.0).cloned() else {
            return Ok(None);
        };
        let Some(pending) = entry
            .groups
            .get_mut(group)
            .and_then(|state| state.pending.get_mut(&message_id.0))
        else {
            return Ok(None);
        };
        let now = Utc::now();
        if pending.idle_for(now) < min_idle {
            return Ok(None);
        }
        pending.consumer = consumer.to_string();
        pending.claimed_at = now;
        pending.delivery_count += 1;
        Ok(Some(StreamMessage {
            stream: stream.to_string(),
            message_id,
            payload,
            delivery_count: pending.delivery_count,
        }))
    }

    async fn ack(&self, stream: &str, group: &str, message_id: MessageId) -> BackendResult<bool> {
        let mut streams = self.streams.lock().expect("streams poisoned");
        let Some(entry) = streams.get_mut(stream) else {
            return Ok(false);
        };
        let removed = entry
            .groups
            .get_mut(group)
            .and_then(|state| state.pending.remove(&message_id.0))
            .is_some();
        entry.collect_consumed();
        Ok(removed)
    }

    async fn dead_letter(
        &self,
        stream: &str,
        group: &str,
        message_id: MessageId,
        reason: &str,
    ) -> BackendResult<bool> {
        let mut streams = self.streams.lock().expect("streams poisoned");
        let Some(entry) = streams.get_mut(stream) else {
            return Ok(false);
        };
        let Some(pending) = entry
            .groups
            .get_mut(group)
            .and_then(|state| state.pending.remove(&message_id.0))
        else {
            return Ok(false);
        };
        let Some(payload) = entry.messages.get(&message_id.0).cloned() else {
            return Ok(false);
        };
        entry.collect_consumed();

        let mut dead_letters = self.dead_letters.lock().expect("dead letters poisoned");
        dead_letters.next_id += 1;
        let id = dead_letters.next_id;
        dead_letters.entries.push(DeadLetter {
            id,
            stream: stream.to_string(),
            group: group.to_string(),
            message_id,
            payload,
            delivery_count: pending.delivery_count,
            reason: reason.to_string(),
            dead_lettered_at: Utc::now(),
        });
        Ok(true)
    }

    async fn list_dead_letters(&self, limit: usize) -> BackendResult<Vec<DeadLetter>> {
        let dead_letters = self.dead_letters.lock().expect("dead letters poisoned");
        Ok(dead_letters.entries.iter().take(limit).cloned().collect())
    }

    async fn requeue_dead_letter(&self, id: i64) -> BackendResult<Option<MessageId>> {
        let letter = {
            let mut dead_letters = self.dead_letters.lock().expect("dead letters poisoned");
            let Some(index) = dead_letters.entries.iter().position(|entry| entry.id == id) else {
                return Ok(None);
            };
            dead_letters.entries.remove(index)
        };
        let mut streams = self.streams.lock().expect("streams poisoned");
        Ok(Some(Self::publish_locked(
            &mut streams,
            &letter.stream,
            letter.payload,
        )))
    }

    async fn stream_summaries(&self, group: &str) -> BackendResult<Vec<StreamSummary>> {
        let streams = self.streams.lock().expect("streams poisoned");
        Ok(streams
            .iter()
            .filter(|(_, entry)| !entry.messages.is_empty())
            .map(|(name, entry)| {
                let state = entry.groups.get(group);
                StreamSummary {
                    stream: name.clone(),
                    length: entry.messages.len() as i64,
                    pending: state.map(|state| state.pending.len() as i64).unwrap_or(0),
                    oldest_claimed_at: state
                        .and_then(|state| state.pending.values().map(|p| p.claimed_at).min()),
                }
            })
            .collect())
    }
}
