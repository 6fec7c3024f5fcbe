//! Discovery loop that keeps one consumer running per active partition.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::WorkerPoolConfig;
use super::consumer::PartitionConsumer;
use crate::backends::{BackendResult, StagingBackend, StreamBackend};
use crate::downstream::ContactUpdater;
use crate::partition::PartitionKey;

const CONSUMER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct WorkerPool<B> {
    pub backend: B,
    pub updater: Arc<dyn ContactUpdater>,
    pub config: WorkerPoolConfig,
}

impl<B> WorkerPool<B>
where
    B: StagingBackend + StreamBackend + Clone + Send + Sync + 'static,
{
    /// Run discovery until shutdown, then wait for consumers to finish their
    /// in-flight message.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            consumer = %self.config.consumer_name,
            group = %self.config.group,
            discovery_interval_ms = self.config.discovery_interval.as_millis(),
            "worker pool started"
        );

        let config = Arc::new(self.config.clone());
        let mut consumers: HashMap<PartitionKey, JoinHandle<()>> = HashMap::new();
        let mut ticker = tokio::time::interval(self.config.discovery_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("worker pool shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    consumers.retain(|_, handle| !handle.is_finished());
                    match self.discover().await {
                        Ok(partitions) => {
                            for partition in partitions {
                                if consumers.contains_key(&partition) {
                                    continue;
                                }
                                debug!(partition = %partition, "starting partition consumer");
                                let consumer = PartitionConsumer::new(
                                    self.backend.clone(),
                                    Arc::clone(&self.updater),
                                    Arc::clone(&config),
                                    partition.clone(),
                                );
                                let handle = tokio::spawn(consumer.run(shutdown.child_token()));
                                consumers.insert(partition, handle);
                            }
                        }
                        Err(err) => error!(error = %err, "partition discovery failed"),
                    }
                }
            }
        }

        for (partition, handle) in consumers {
            match tokio::time::timeout(CONSUMER_SHUTDOWN_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(partition = %partition, error = ?err, "consumer task panicked")
                }
                Err(_) => warn!(partition = %partition, "timed out waiting for consumer"),
            }
        }
        info!("worker pool stopped");
    }

    /// Partitions with retained stream messages or recently staged work.
    pub async fn discover(&self) -> BackendResult<Vec<PartitionKey>> {
        let mut partitions = BTreeSet::new();
        for stream in self.backend.list_streams().await? {
            match PartitionKey::from_stream_name(&stream) {
                Some(partition) => {
                    partitions.insert(partition);
                }
                None => debug!(stream = %stream, "ignoring unrecognized stream"),
            }
        }

        let lookback = chrono::Duration::from_std(self.config.discovery_lookback)
            .unwrap_or_else(|_| chrono::Duration::zero());
        partitions.extend(self.backend.recent_partitions(Utc::now() - lookback).await?);
        Ok(partitions.into_iter().collect())
    }
}
