//! Storage backends for staged work, cached field ids, and streams.

mod base;
mod fault_injection;
mod memory;
mod postgres;

pub use base::{
    BackendError, BackendResult, DeadLetter, FieldIdCacheBackend, FieldIdCacheEntry, MessageId,
    NewWorkItem, PendingEntry, StagingBackend, StagingSummary, StreamBackend, StreamMessage,
    StreamPayload, StreamSummary, WorkItem, WorkItemId,
};
pub use fault_injection::FaultInjectingBackend;
pub use memory::MemoryBackend;
pub use postgres::PostgresBackend;

/// Everything a process needs from storage.
pub trait Backend: StagingBackend + FieldIdCacheBackend + StreamBackend {}

impl<T> Backend for T where T: StagingBackend + FieldIdCacheBackend + StreamBackend {}
