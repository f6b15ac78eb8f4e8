use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::{Checkpoint, CheckpointStore, ensure_monotonic};
use crate::error::Result;
use crate::persist::{read_json, write_json_atomic};
use crate::types::ids::SubscriberId;

/// One JSON file per subscriber, atomically rewritten on every save.
#[derive(Clone, Debug)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    // Serializes read-compare-write per subscriber inside this process.
    locks: Arc<Mutex<HashMap<SubscriberId, Arc<Mutex<()>>>>>,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, subscriber_id: &SubscriberId) -> PathBuf {
        self.dir.join(format!("{}.json", subscriber_id.file_stem()))
    }

    async fn lock_for(&self, subscriber_id: &SubscriberId) -> Arc<Mutex<()>> {
        let mut guard = self.locks.lock().await;
        Arc::clone(guard.entry(subscriber_id.clone()).or_default())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, subscriber_id: &SubscriberId) -> Result<Option<Checkpoint>> {
        read_json(&self.path_for(subscriber_id)).await
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let lock = self.lock_for(&checkpoint.subscriber_id).await;
        let _held = lock.lock().await;

        let path = self.path_for(&checkpoint.subscriber_id);
        let current: Option<Checkpoint> = read_json(&path).await?;
        ensure_monotonic(current.as_ref(), checkpoint)?;
        if current.as_ref().map(Checkpoint::position) == Some(checkpoint.position()) {
            return Ok(());
        }

        write_json_atomic(&path, checkpoint).await?;
        debug!(
            target: "lessor::checkpoint",
            subscriber = %checkpoint.subscriber_id,
            height = checkpoint.last_height,
            seq = checkpoint.last_event_seq,
            "checkpoint saved"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::EventPosition;
    use crate::error::LessorError;

    #[tokio::test]
    async fn save_then_load_round_trips_and_never_regresses() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileCheckpointStore::new(dir.path());
        let id = SubscriberId::new("provider");

        assert!(store.load(&id).await.expect("load").is_none());

        let heights = [(5, 0), (5, 2), (9, 1), (9, 1), (12, 0)];
        for (height, seq) in heights {
            store
                .save(&Checkpoint::new(id.clone(), EventPosition::new(height, seq)))
                .await
                .expect("monotonic save");
        }

        let err = store
            .save(&Checkpoint::new(id.clone(), EventPosition::new(11, 7)))
            .await
            .expect_err("regression must be rejected");
        assert!(matches!(err, LessorError::Conflict(_)));

        let loaded = store.load(&id).await.expect("load").expect("present");
        assert_eq!(loaded.position(), EventPosition::new(12, 0));
    }

    #[tokio::test]
    async fn interrupted_write_leaves_last_checkpoint_intact() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileCheckpointStore::new(dir.path());
        let id = SubscriberId::new("provider");
        store
            .save(&Checkpoint::new(id.clone(), EventPosition::new(40, 3)))
            .await
            .expect("save");

        // A crash between temp-file write and rename leaves a partial temp
        // file next to the real one.
        std::fs::write(dir.path().join(".tmpXYZ"), b"{\"subscriber_id\":\"prov").expect("stray");

        let loaded = store.load(&id).await.expect("load").expect("present");
        assert_eq!(loaded.position(), EventPosition::new(40, 3));
    }

    #[tokio::test]
    async fn corrupt_file_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileCheckpointStore::new(dir.path());
        let id = SubscriberId::new("provider");
        std::fs::write(store.path_for(&id), b"not json").expect("write");

        let err = store.load(&id).await.expect_err("corrupt");
        assert!(err.is_fatal());
    }
}
