use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::downstream::{ContactUpdater, DownstreamError, FieldUpdate};

/// Records successful updates; fails the first `fail_first` attempts.
#[derive(Default)]
pub struct RecordingUpdater {
    updates: Mutex<Vec<FieldUpdate>>,
    attempts: AtomicUsize,
    fail_first: usize,
}

impl RecordingUpdater {
    pub fn failing(fail_first: usize) -> Self {
        Self {
            fail_first,
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> Vec<FieldUpdate> {
        self.updates.lock().expect("updates poisoned").clone()
    }

    pub fn entities(&self) -> Vec<String> {
        self.updates()
            .into_iter()
            .map(|update| update.entity_id)
            .collect()
    }
}

#[async_trait]
impl ContactUpdater for RecordingUpdater {
    async fn update_field(&self, update: &FieldUpdate) -> Result<(), DownstreamError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_first {
            return Err(DownstreamError::Status {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        self.updates
            .lock()
            .expect("updates poisoned")
            .push(update.clone());
        Ok(())
    }
}
