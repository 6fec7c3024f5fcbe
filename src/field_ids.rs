//! Cache-first resolution of the downstream field id for a partition.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::backends::{BackendError, FieldIdCacheBackend};
use crate::downstream::{DownstreamError, FieldDirectory};
use crate::partition::PartitionKey;

#[derive(Debug, Error)]
pub enum FieldIdError {
    #[error("no matching custom field for location {location_id}")]
    NotFound { location_id: String },
    #[error(transparent)]
    Downstream(#[from] DownstreamError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[derive(Clone)]
pub struct FieldIdResolver<B> {
    backend: B,
    directory: Arc<dyn FieldDirectory>,
}

impl<B> FieldIdResolver<B>
where
    B: FieldIdCacheBackend + Clone,
{
    pub fn new(backend: B, directory: Arc<dyn FieldDirectory>) -> Self {
        Self { backend, directory }
    }

    /// Cached id, or one directory lookup stored for next time.
    ///
    /// Concurrent first lookups may both hit the directory; the cache keeps
    /// whichever id was stored first and both callers get that one.
    pub async fn resolve(&self, partition: &PartitionKey) -> Result<String, FieldIdError> {
        if let Some(entry) = self.backend.get_field_id(partition).await? {
            debug!(partition = %partition, "field id cache hit");
            return Ok(entry.field_id);
        }

        let Some(field_id) = self.directory.lookup_field_id(partition).await? else {
            return Err(FieldIdError::NotFound {
                location_id: partition.location_id().to_string(),
            });
        };
        let stored = self.backend.put_field_id(partition, &field_id).await?;
        info!(partition = %partition, field_id = %stored.field_id, "cached field id");
        Ok(stored.field_id)
    }
}
