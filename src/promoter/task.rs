//! Background promotion task.
//!
//! This task periodically selects due work items, publishes each one to its
//! partition's stream, and only then removes it from staging.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::backends::{BackendError, StagingBackend, StreamBackend, WorkItem};
use crate::partition::PartitionKey;

/// Configuration for the promotion task.
#[derive(Debug, Clone)]
pub struct PromoterConfig {
    /// Sleep after a normal pass.
    pub poll_interval: Duration,
    /// Sleep after a pass that failed outright.
    pub error_backoff: Duration,
    /// Maximum number of due items to promote per pass.
    pub batch_size: usize,
}

impl Default for PromoterConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
            batch_size: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PromotionReport {
    pub selected: usize,
    pub promoted: usize,
    pub failed: usize,
    /// Left staged because an earlier item of the same partition failed.
    pub deferred: usize,
}

#[derive(Debug, Error)]
pub enum PromotionError {
    #[error("failed to select due work items: {0}")]
    Select(#[source] BackendError),
}

/// Background promotion task.
pub struct PromoterTask<B> {
    pub backend: B,
    pub config: PromoterConfig,
}

impl<B> PromoterTask<B>
where
    B: StagingBackend + StreamBackend + Clone + Send + Sync + 'static,
{
    /// Run the promotion loop until shutdown.
    pub async fn run(self, shutdown: tokio_util::sync::WaitForCancellationFutureOwned) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis(),
            error_backoff_ms = self.config.error_backoff.as_millis(),
            batch_size = self.config.batch_size,
            "promoter task started"
        );

        let mut shutdown = std::pin::pin!(shutdown);

        loop {
            let pause = match self.promote_due().await {
                Ok(report) => {
                    if report.selected > 0 {
                        info!(
                            selected = report.selected,
                            promoted = report.promoted,
                            failed = report.failed,
                            deferred = report.deferred,
                            "promotion pass finished"
                        );
                    }
                    self.config.poll_interval
                }
                Err(err) => {
                    error!(error = %err, "promotion pass failed");
                    self.config.error_backoff
                }
            };

            tokio::select! {
                _ = &mut shutdown => {
                    info!("promoter task shutting down");
                    break;
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    pub async fn promote_due(&self) -> Result<PromotionReport, PromotionError> {
        self.promote_due_at(Utc::now()).await
    }

    /// Promote items with `run_at <= now`, oldest first.
    ///
    /// A failed item stays staged and is retried on a later pass, together
    /// with every later item of its partition. An item whose delete fails
    /// after publishing will be published again.
    pub async fn promote_due_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<PromotionReport, PromotionError> {
        let items = self
            .backend
            .fetch_due_work_items(now, self.config.batch_size)
            .await
            .map_err(PromotionError::Select)?;

        let mut report = PromotionReport {
            selected: items.len(),
            ..PromotionReport::default()
        };
        if items.is_empty() {
            return Ok(report);
        }
        debug!(count = items.len(), "found due work items");

        let mut blocked: HashSet<PartitionKey> = HashSet::new();
        for item in &items {
            if blocked.contains(&item.partition) {
                report.deferred += 1;
                continue;
            }
            match self.promote_one(item, now).await {
                Ok(()) => report.promoted += 1,
                Err(err) => {
                    report.failed += 1;
                    blocked.insert(item.partition.clone());
                    warn!(
                        item_id = %item.id,
                        partition = %item.partition,
                        error = %err,
                        "failed to promote work item"
                    );
                }
            }
        }
        Ok(report)
    }

    async fn promote_one(&self, item: &WorkItem, now: DateTime<Utc>) -> Result<(), BackendError> {
        let stream = item.partition.stream_name();
        let message_id = self.backend.publish(&stream, &item.to_payload(now)).await?;
        if !self.backend.delete_work_item(item.id).await? {
            debug!(item_id = %item.id, "work item already removed after publish");
        }
        debug!(
            item_id = %item.id,
            stream = %stream,
            message_id = %message_id,
            "promoted work item"
        );
        Ok(())
    }
}
