//! Dripline - sequential delay scheduling with ordered at-least-once delivery
//! per partition.

pub mod admin;
pub mod api;
pub mod backends;
pub mod config;
pub mod db;
pub mod downstream;
pub mod enqueue;
pub mod field_ids;
pub mod observability;
pub mod partition;
pub mod promoter;
pub mod schedule;
pub mod workers;

pub use api::{ApiServer, build_router};
pub use backends::{
    Backend, BackendError, BackendResult, FaultInjectingBackend, MemoryBackend, PostgresBackend,
};
pub use config::Config;
pub use downstream::{ContactUpdater, DownstreamConfig, FieldDirectory, HttpConnector};
pub use enqueue::{EnqueueError, EnqueueRequest, EnqueueService, Enqueued};
pub use observability::obs;
pub use partition::PartitionKey;
pub use promoter::{PromoterConfig, PromoterTask, PromotionReport};
pub use schedule::{DelayRange, DelayRangeError};
pub use workers::{WorkerPool, WorkerPoolConfig};
