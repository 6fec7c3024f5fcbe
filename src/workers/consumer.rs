//! Per-partition stream consumer.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::WorkerPoolConfig;
use crate::backends::{
    BackendError, BackendResult, MessageId, StagingBackend, StreamBackend, StreamMessage,
};
use crate::downstream::{ContactUpdater, FieldUpdate};
use crate::partition::PartitionKey;

/// Lifecycle of a consumer. It only moves forward until it returns to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Joined,
    Reading,
    Processing,
}

/// What one read-and-handle step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Downstream update succeeded and the message was acknowledged.
    Processed(MessageId),
    /// Downstream update failed; the message stays pending for reclaim.
    Failed(MessageId),
    /// Delivery budget exhausted; the message moved to the dead letters.
    DeadLettered(MessageId),
    /// Another delivery is pending and not yet reclaimable.
    Waiting,
    /// Nothing new and nothing pending.
    Empty,
}

enum Poll {
    Message(StreamMessage),
    Waiting,
    Empty,
}

pub struct PartitionConsumer<B> {
    backend: B,
    updater: Arc<dyn ContactUpdater>,
    config: Arc<WorkerPoolConfig>,
    partition: PartitionKey,
    stream: String,
    state: ConsumerState,
}

impl<B> PartitionConsumer<B>
where
    B: StagingBackend + StreamBackend + Clone + Send + Sync + 'static,
{
    pub fn new(
        backend: B,
        updater: Arc<dyn ContactUpdater>,
        config: Arc<WorkerPoolConfig>,
        partition: PartitionKey,
    ) -> Self {
        let stream = partition.stream_name();
        Self {
            backend,
            updater,
            config,
            partition,
            stream,
            state: ConsumerState::Idle,
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    /// Join the group idempotently.
    pub async fn join(&mut self) -> BackendResult<()> {
        self.backend
            .ensure_group(&self.stream, &self.config.group)
            .await?;
        self.state = ConsumerState::Joined;
        Ok(())
    }

    /// Consume until shutdown or until the partition has been quiet for
    /// `idle_timeout`.
    pub async fn run(mut self, shutdown: CancellationToken) {
        if let Err(err) = self.join().await {
            error!(stream = %self.stream, error = %err, "failed to join consumer group");
            return;
        }
        info!(
            partition = %self.partition,
            stream = %self.stream,
            group = %self.config.group,
            consumer = %self.config.consumer_name,
            "partition consumer started"
        );

        let mut last_activity = Instant::now();
        while !shutdown.is_cancelled() {
            match self.step(&shutdown).await {
                Ok(StepOutcome::Empty) => {
                    if last_activity.elapsed() >= self.config.idle_timeout {
                        info!(stream = %self.stream, "partition idle; consumer exiting");
                        break;
                    }
                }
                Ok(_) => last_activity = Instant::now(),
                Err(BackendError::MissingGroup { .. }) => {
                    warn!(stream = %self.stream, "consumer group vanished; rejoining");
                    if let Err(err) = self.join().await {
                        error!(
                            stream = %self.stream,
                            error = %err,
                            "failed to rejoin consumer group"
                        );
                        self.pause(&shutdown).await;
                    }
                }
                Err(err) => {
                    error!(stream = %self.stream, error = %err, "consumer step failed");
                    self.pause(&shutdown).await;
                }
            }
        }

        self.state = ConsumerState::Idle;
        debug!(stream = %self.stream, "partition consumer stopped");
    }

    /// Read one new message, or reclaim a stale one, and handle it.
    pub async fn step(&mut self, shutdown: &CancellationToken) -> BackendResult<StepOutcome> {
        self.state = ConsumerState::Reading;
        let message = match self.read_blocking(shutdown).await? {
            Some(message) => message,
            None => match self.reclaim().await? {
                Poll::Message(message) => message,
                Poll::Waiting => return Ok(StepOutcome::Waiting),
                Poll::Empty => return Ok(StepOutcome::Empty),
            },
        };

        self.state = ConsumerState::Processing;
        let outcome = self.handle(message).await;
        self.state = ConsumerState::Reading;
        outcome
    }

    async fn read_blocking(
        &self,
        shutdown: &CancellationToken,
    ) -> BackendResult<Option<StreamMessage>> {
        let deadline = Instant::now() + self.config.block_timeout;
        loop {
            if let Some(message) = self
                .backend
                .read_new(&self.stream, &self.config.group, &self.config.consumer_name)
                .await?
            {
                return Ok(Some(message));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let pause = self.config.read_poll_interval.min(deadline - now);
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(None),
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    async fn reclaim(&self) -> BackendResult<Poll> {
        let pending = self
            .backend
            .pending(&self.stream, &self.config.group, 1)
            .await?;
        let Some(oldest) = pending.first() else {
            return Ok(Poll::Empty);
        };
        if oldest.idle_for(Utc::now()) < self.config.claim_timeout {
            return Ok(Poll::Waiting);
        }
        let claimed = self
            .backend
            .claim(
                &self.stream,
                &self.config.group,
                &self.config.consumer_name,
                oldest.message_id,
                self.config.claim_timeout,
            )
            .await?;
        match claimed {
            Some(message) => {
                info!(
                    stream = %self.stream,
                    message_id = %message.message_id,
                    previous_owner = %oldest.consumer,
                    delivery_count = message.delivery_count,
                    "reclaimed stale delivery"
                );
                Ok(Poll::Message(message))
            }
            // Someone else claimed it first.
            None => Ok(Poll::Waiting),
        }
    }

    async fn handle(&self, message: StreamMessage) -> BackendResult<StepOutcome> {
        let message_id = message.message_id;
        if message.delivery_count > self.config.max_deliveries {
            let reason = format!(
                "delivery count {} exceeded limit {}",
                message.delivery_count, self.config.max_deliveries
            );
            self.backend
                .dead_letter(&self.stream, &self.config.group, message_id, &reason)
                .await?;
            warn!(
                stream = %self.stream,
                message_id = %message_id,
                entity_id = %message.payload.entity_id,
                reason = %reason,
                "moved message to dead letters"
            );
            return Ok(StepOutcome::DeadLettered(message_id));
        }

        let payload = &message.payload;
        let update = FieldUpdate {
            location_id: payload.partition.location_id().to_string(),
            entity_id: payload.entity_id.clone(),
            field_id: payload.field_id.clone(),
            value: self.config.field_value.clone(),
        };
        if let Err(err) = self.updater.update_field(&update).await {
            warn!(
                stream = %self.stream,
                message_id = %message_id,
                entity_id = %payload.entity_id,
                delivery_count = message.delivery_count,
                error = %err,
                "downstream update failed; leaving message for reclaim"
            );
            return Ok(StepOutcome::Failed(message_id));
        }

        self.backend
            .ack(&self.stream, &self.config.group, message_id)
            .await?;
        let discarded = self
            .backend
            .discard_delivered(&payload.entity_id, &payload.partition, payload.run_at)
            .await?;
        info!(
            stream = %self.stream,
            message_id = %message_id,
            entity_id = %payload.entity_id,
            run_at = %payload.run_at,
            discarded,
            "delivered field update"
        );
        Ok(StepOutcome::Processed(message_id))
    }

    async fn pause(&self, shutdown: &CancellationToken) {
        let pause = self.config.read_poll_interval.max(Duration::from_millis(100));
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(pause) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backends::{MemoryBackend, StreamPayload};
    use crate::workers::test_support::RecordingUpdater;

    fn config(consumer: &str) -> Arc<WorkerPoolConfig> {
        Arc::new(WorkerPoolConfig {
            consumer_name: consumer.to_string(),
            read_poll_interval: Duration::from_millis(5),
            block_timeout: Duration::from_millis(20),
            claim_timeout: Duration::from_millis(200),
            idle_timeout: Duration::from_millis(60),
            max_deliveries: 3,
            ..WorkerPoolConfig::default()
        })
    }

    async fn publish(
        backend: &MemoryBackend,
        partition: &PartitionKey,
        entity: &str,
    ) -> MessageId {
        let now = Utc::now();
        backend
            .publish(
                &partition.stream_name(),
                &StreamPayload {
                    entity_id: entity.to_string(),
                    partition: partition.clone(),
                    field_id: "field-1".to_string(),
                    run_at: now,
                    enqueued_at: now,
                },
            )
            .await
            .expect("publish")
    }

    #[tokio::test]
    async fn processes_messages_in_stream_order() {
        let backend = MemoryBackend::new();
        let partition = PartitionKey::new("loc", Some("wf"));
        let updater = Arc::new(RecordingUpdater::default());
        let mut consumer = PartitionConsumer::new(
            backend.clone(),
            updater.clone(),
            config("w1"),
            partition.clone(),
        );
        consumer.join().await.expect("join");
        assert_eq!(consumer.state(), ConsumerState::Joined);

        let first = publish(&backend, &partition, "c1").await;
        let second = publish(&backend, &partition, "c2").await;
        let shutdown = CancellationToken::new();

        assert_eq!(
            consumer.step(&shutdown).await.expect("step"),
            StepOutcome::Processed(first)
        );
        assert_eq!(
            consumer.step(&shutdown).await.expect("step"),
            StepOutcome::Processed(second)
        );
        assert_eq!(
            consumer.step(&shutdown).await.expect("step"),
            StepOutcome::Empty
        );

        assert_eq!(updater.entities(), vec!["c1", "c2"]);
        let updates = updater.updates();
        assert_eq!(updates[0].location_id, "loc");
        assert_eq!(updates[0].value, "YES");
        assert!(backend.stream_messages(&partition.stream_name()).is_empty());
    }

    #[tokio::test]
    async fn crashed_delivery_is_reclaimed_after_claim_timeout() {
        let backend = MemoryBackend::new();
        let partition = PartitionKey::new("loc", None);
        let stream = partition.stream_name();
        let updater = Arc::new(RecordingUpdater::default());
        let mut survivor = PartitionConsumer::new(
            backend.clone(),
            updater.clone(),
            config("w2"),
            partition.clone(),
        );
        survivor.join().await.expect("join");

        let id = publish(&backend, &partition, "c1").await;
        publish(&backend, &partition, "c2").await;
        // w1 takes the first message and dies without acknowledging.
        backend
            .read_new(&stream, "dripline", "w1")
            .await
            .expect("read")
            .expect("message");

        let shutdown = CancellationToken::new();
        assert_eq!(
            survivor.step(&shutdown).await.expect("step"),
            StepOutcome::Waiting
        );
        assert!(updater.entities().is_empty());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(
            survivor.step(&shutdown).await.expect("step"),
            StepOutcome::Processed(id)
        );
        survivor.step(&shutdown).await.expect("step");
        assert_eq!(updater.entities(), vec!["c1", "c2"]);
    }

    #[tokio::test]
    async fn failed_update_is_retried_then_dead_lettered() {
        let backend = MemoryBackend::new();
        let partition = PartitionKey::new("loc", None);
        let stream = partition.stream_name();
        let updater = Arc::new(RecordingUpdater::failing(usize::MAX));
        let mut consumer = PartitionConsumer::new(
            backend.clone(),
            updater.clone(),
            config("w1"),
            partition.clone(),
        );
        consumer.join().await.expect("join");
        let id = publish(&backend, &partition, "c1").await;
        let shutdown = CancellationToken::new();

        assert_eq!(
            consumer.step(&shutdown).await.expect("step"),
            StepOutcome::Failed(id)
        );
        for _ in 0..2 {
            assert!(backend.age_pending_entry(&stream, "dripline", id, Duration::from_secs(1)));
            assert_eq!(
                consumer.step(&shutdown).await.expect("step"),
                StepOutcome::Failed(id)
            );
        }
        assert!(backend.age_pending_entry(&stream, "dripline", id, Duration::from_secs(1)));
        assert_eq!(
            consumer.step(&shutdown).await.expect("step"),
            StepOutcome::DeadLettered(id)
        );

        assert_eq!(updater.attempts(), 3);
        let letters = backend.list_dead_letters(10).await.expect("dead letters");
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].delivery_count, 4);
        assert_eq!(
            consumer.step(&shutdown).await.expect("step"),
            StepOutcome::Empty
        );
    }

    #[tokio::test]
    async fn failed_ack_leaves_message_pending_and_repeats_the_update() {
        use crate::backends::FaultInjectingBackend;

        let backend = FaultInjectingBackend::new(MemoryBackend::new());
        let partition = PartitionKey::new("loc", None);
        let stream = partition.stream_name();
        let updater = Arc::new(RecordingUpdater::default());
        let mut consumer = PartitionConsumer::new(
            backend.clone(),
            updater.clone(),
            config("w1"),
            partition.clone(),
        );
        consumer.join().await.expect("join");
        let id = publish(backend.inner(), &partition, "c1").await;
        let shutdown = CancellationToken::new();

        backend.set_fail_ack(true);
        assert!(consumer.step(&shutdown).await.is_err());
        assert_eq!(updater.entities(), vec!["c1"]);
        let pending = backend.pending(&stream, "dripline", 10).await.expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message_id, id);

        backend.set_fail_ack(false);
        assert_eq!(
            consumer.step(&shutdown).await.expect("step"),
            StepOutcome::Waiting
        );
        assert!(
            backend
                .inner()
                .age_pending_entry(&stream, "dripline", id, Duration::from_secs(1))
        );
        assert_eq!(
            consumer.step(&shutdown).await.expect("step"),
            StepOutcome::Processed(id)
        );
        assert_eq!(updater.entities(), vec!["c1", "c1"]);
        assert!(backend.inner().stream_messages(&stream).is_empty());
    }

    #[tokio::test]
    async fn acknowledged_delivery_discards_leftover_staging_rows() {
        use crate::backends::NewWorkItem;

        let backend = MemoryBackend::new();
        let partition = PartitionKey::new("loc", None);
        let staged = backend
            .stage_work_item(&NewWorkItem {
                entity_id: "c1".to_string(),
                partition: partition.clone(),
                field_id: "field-1".to_string(),
                delay_seconds: 0,
            })
            .await
            .expect("stage");
        // Published but not yet removed from staging.
        backend
            .publish(&partition.stream_name(), &staged.to_payload(Utc::now()))
            .await
            .expect("publish");

        let mut consumer = PartitionConsumer::new(
            backend.clone(),
            Arc::new(RecordingUpdater::default()),
            config("w1"),
            partition.clone(),
        );
        consumer.join().await.expect("join");
        let outcome = consumer
            .step(&CancellationToken::new())
            .await
            .expect("step");
        assert!(matches!(outcome, StepOutcome::Processed(_)));
        assert!(backend.staged_items().is_empty());
    }

    #[tokio::test]
    async fn run_exits_after_idle_timeout() {
        let backend = MemoryBackend::new();
        let partition = PartitionKey::new("loc", None);
        let consumer = PartitionConsumer::new(
            backend,
            Arc::new(RecordingUpdater::default()),
            config("w1"),
            partition,
        );
        tokio::time::timeout(Duration::from_secs(5), consumer.run(CancellationToken::new()))
            .await
            .expect("consumer exits when idle");
    }
}
