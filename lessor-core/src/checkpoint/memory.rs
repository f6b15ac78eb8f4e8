use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Checkpoint, CheckpointStore, ensure_monotonic};
use crate::error::Result;
use crate::types::ids::SubscriberId;

/// Volatile checkpoint store for tests and dry runs.
#[derive(Clone, Debug, Default)]
pub struct InMemoryCheckpointStore {
    inner: Arc<Mutex<HashMap<SubscriberId, Checkpoint>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, subscriber_id: &SubscriberId) -> Result<Option<Checkpoint>> {
        let guard = self.inner.lock().await;
        Ok(guard.get(subscriber_id).cloned())
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut guard = self.inner.lock().await;
        ensure_monotonic(guard.get(&checkpoint.subscriber_id), checkpoint)?;
        guard.insert(checkpoint.subscriber_id.clone(), checkpoint.clone());
        Ok(())
    }
}
