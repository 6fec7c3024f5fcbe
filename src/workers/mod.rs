//! Worker side: per-partition consumers and the pool that discovers them.

mod consumer;
mod pool;
#[cfg(test)]
mod test_support;

use std::time::Duration;

pub use consumer::{ConsumerState, PartitionConsumer, StepOutcome};
pub use pool::WorkerPool;

use crate::downstream::DEFAULT_FIELD_VALUE;

pub const DEFAULT_CONSUMER_GROUP: &str = "dripline";

/// Configuration for the worker pool and its consumers.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Consumer group shared by every worker process.
    pub group: String,
    /// Unique name of this worker process within the group.
    pub consumer_name: String,
    pub discovery_interval: Duration,
    /// Partitions staged within this window get a consumer.
    pub discovery_lookback: Duration,
    pub read_poll_interval: Duration,
    /// How long one read waits for a new message.
    pub block_timeout: Duration,
    /// Idle time after which another consumer may take over a delivery.
    pub claim_timeout: Duration,
    /// Quiet period after which a consumer exits.
    pub idle_timeout: Duration,
    /// Deliveries allowed before a message is dead-lettered.
    pub max_deliveries: i32,
    pub field_value: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            group: DEFAULT_CONSUMER_GROUP.to_string(),
            consumer_name: default_consumer_name(),
            discovery_interval: Duration::from_secs(5),
            discovery_lookback: Duration::from_secs(10 * 60),
            read_poll_interval: Duration::from_millis(250),
            block_timeout: Duration::from_secs(5),
            claim_timeout: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(60),
            max_deliveries: 10,
            field_value: DEFAULT_FIELD_VALUE.to_string(),
        }
    }
}

pub fn default_consumer_name() -> String {
    format!("worker-{}", uuid::Uuid::new_v4())
}
