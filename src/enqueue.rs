//! Enqueue service: validate, resolve the field id, then stage under the partition lock.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};

use crate::backends::{BackendError, FieldIdCacheBackend, NewWorkItem, StagingBackend, WorkItem};
use crate::downstream::{DownstreamError, FieldDirectory};
use crate::field_ids::{FieldIdError, FieldIdResolver};
use crate::partition::PartitionKey;
use crate::schedule::{DelayRange, DelayRangeError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueRequest {
    pub entity_id: String,
    pub partition: PartitionKey,
    pub min_delay_seconds: i64,
    pub max_delay_seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enqueued {
    pub item: WorkItem,
}

impl Enqueued {
    pub fn run_at(&self) -> DateTime<Utc> {
        self.item.run_at
    }

    pub fn delay_seconds(&self) -> i64 {
        self.item.delay_seconds
    }
}

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error(transparent)]
    InvalidRange(#[from] DelayRangeError),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("custom field not found for location {location_id}")]
    DownstreamFieldNotFound { location_id: String },
    #[error("field directory lookup failed: {0}")]
    Downstream(#[source] DownstreamError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl EnqueueError {
    /// Stable code reported to callers.
    pub fn code(&self) -> &'static str {
        match self {
            EnqueueError::InvalidRange(_) => "InvalidRange",
            EnqueueError::MissingField(_) => "MissingField",
            EnqueueError::DownstreamFieldNotFound { .. } => "DownstreamFieldNotFound",
            EnqueueError::Downstream(_) | EnqueueError::Backend(_) => "InternalError",
        }
    }
}

impl From<FieldIdError> for EnqueueError {
    fn from(err: FieldIdError) -> Self {
        match err {
            FieldIdError::NotFound { location_id } => {
                EnqueueError::DownstreamFieldNotFound { location_id }
            }
            FieldIdError::Downstream(err) => EnqueueError::Downstream(err),
            FieldIdError::Backend(err) => EnqueueError::Backend(err),
        }
    }
}

#[derive(Clone)]
pub struct EnqueueService<B> {
    backend: B,
    resolver: FieldIdResolver<B>,
}

impl<B> EnqueueService<B>
where
    B: StagingBackend + FieldIdCacheBackend + Clone,
{
    pub fn new(backend: B, directory: Arc<dyn FieldDirectory>) -> Self {
        Self {
            resolver: FieldIdResolver::new(backend.clone(), directory),
            backend,
        }
    }

    /// Stage one work item behind everything already staged for its partition.
    ///
    /// Nothing is persisted when validation or field resolution fails. The
    /// directory lookup runs before the partition lock is taken.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<Enqueued, EnqueueError> {
        if request.entity_id.trim().is_empty() {
            return Err(EnqueueError::MissingField("contact_id"));
        }
        if request.partition.location_id().trim().is_empty() {
            return Err(EnqueueError::MissingField("location_id"));
        }
        let range = DelayRange::new(request.min_delay_seconds, request.max_delay_seconds)?;

        let field_id = match self.resolver.resolve(&request.partition).await {
            Ok(field_id) => field_id,
            Err(err) => {
                warn!(partition = %request.partition, error = %err, "field id resolution failed");
                return Err(err.into());
            }
        };

        let delay_seconds = range.draw(&mut rand::thread_rng());
        let item = self
            .backend
            .stage_work_item(&NewWorkItem {
                entity_id: request.entity_id,
                partition: request.partition,
                field_id,
                delay_seconds,
            })
            .await?;

        info!(
            item_id = %item.id,
            entity_id = %item.entity_id,
            partition = %item.partition,
            delay_seconds,
            run_at = %item.run_at,
            "staged work item"
        );
        Ok(Enqueued { item })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::backends::MemoryBackend;

    struct StubDirectory {
        answer: Option<String>,
        calls: AtomicUsize,
    }

    impl StubDirectory {
        fn returning(answer: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                answer: answer.map(str::to_string),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl FieldDirectory for StubDirectory {
        async fn lookup_field_id(
            &self,
            _partition: &PartitionKey,
        ) -> Result<Option<String>, DownstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.answer.clone())
        }
    }

    fn request(entity: &str, partition: &PartitionKey, min: i64, max: i64) -> EnqueueRequest {
        EnqueueRequest {
            entity_id: entity.to_string(),
            partition: partition.clone(),
            min_delay_seconds: min,
            max_delay_seconds: max,
        }
    }

    #[tokio::test]
    async fn second_enqueue_chains_after_first() {
        let backend = MemoryBackend::new();
        let service = EnqueueService::new(backend.clone(), StubDirectory::returning(Some("f1")));
        let partition = PartitionKey::new("loc", Some("wf"));

        let before = Utc::now();
        let first = service
            .enqueue(request("c1", &partition, 60, 300))
            .await
            .expect("first");
        let second = service
            .enqueue(request("c2", &partition, 60, 300))
            .await
            .expect("second");

        assert!(first.run_at() >= before + ChronoDuration::seconds(60));
        assert!(first.run_at() <= Utc::now() + ChronoDuration::seconds(300));
        assert!((60..=300).contains(&first.delay_seconds()));
        assert_eq!(
            second.run_at(),
            first.run_at() + ChronoDuration::seconds(second.delay_seconds())
        );
        assert_eq!(first.item.field_id, "f1");
    }

    #[tokio::test]
    async fn invalid_input_is_rejected_before_any_lookup() {
        let directory = StubDirectory::returning(Some("f1"));
        let backend = MemoryBackend::new();
        let service = EnqueueService::new(backend.clone(), directory.clone());
        let partition = PartitionKey::new("loc", None);

        let err = service
            .enqueue(request("c1", &partition, 300, 60))
            .await
            .expect_err("inverted");
        assert_eq!(err.code(), "InvalidRange");

        let err = service
            .enqueue(request(" ", &partition, 0, 60))
            .await
            .expect_err("blank entity");
        assert_eq!(err.code(), "MissingField");

        let err = service
            .enqueue(request("c1", &PartitionKey::new("", None), 0, 60))
            .await
            .expect_err("blank location");
        assert_eq!(err.code(), "MissingField");

        assert_eq!(directory.calls.load(Ordering::SeqCst), 0);
        assert!(backend.staged_items().is_empty());
    }

    #[tokio::test]
    async fn missing_downstream_field_stages_nothing() {
        let backend = MemoryBackend::new();
        let service = EnqueueService::new(backend.clone(), StubDirectory::returning(None));
        let partition = PartitionKey::new("loc", None);

        let err = service
            .enqueue(request("c1", &partition, 0, 0))
            .await
            .expect_err("no field");
        assert!(matches!(err, EnqueueError::DownstreamFieldNotFound { .. }));
        assert_eq!(err.code(), "DownstreamFieldNotFound");
        assert!(backend.staged_items().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_enqueues_commit_in_run_at_order() {
        let backend = MemoryBackend::new();
        let service = EnqueueService::new(backend.clone(), StubDirectory::returning(Some("f1")));
        let partition = PartitionKey::new("loc", Some("wf"));

        let mut handles = Vec::new();
        for index in 0..32 {
            let service = service.clone();
            let request = request(&format!("c{index}"), &partition, 1, 5);
            handles.push(tokio::spawn(async move { service.enqueue(request).await }));
        }
        for handle in handles {
            handle.await.expect("join").expect("enqueue");
        }

        let mut staged = backend.staged_items();
        staged.sort_by_key(|item| item.id);
        assert_eq!(staged.len(), 32);
        for pair in staged.windows(2) {
            assert!(
                pair[1].run_at >= pair[0].run_at + ChronoDuration::seconds(pair[1].delay_seconds),
                "commit order must follow run_at order"
            );
        }
    }
}
