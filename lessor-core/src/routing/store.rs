use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{RoutingRecord, RoutingStore};
use crate::error::Result;
use crate::persist::{read_json, write_json_atomic};
use crate::types::OrderId;

/// All records in one JSON file, rewritten atomically on every change.
#[derive(Debug)]
pub struct FileRoutingStore {
    path: PathBuf,
    records: Mutex<BTreeMap<OrderId, RoutingRecord>>,
}

impl FileRoutingStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records: Vec<RoutingRecord> = read_json(&path).await?.unwrap_or_default();
        let records = records
            .into_iter()
            .map(|record| (record.order_id.clone(), record))
            .collect();
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RoutingStore for FileRoutingStore {
    async fn get(&self, order_id: &OrderId) -> Result<Option<RoutingRecord>> {
        Ok(self.records.lock().await.get(order_id).cloned())
    }

    async fn upsert(&self, record: &RoutingRecord) -> Result<()> {
        let mut records = self.records.lock().await;
        let previous = records.insert(record.order_id.clone(), record.clone());
        let snapshot: Vec<RoutingRecord> = records.values().cloned().collect();
        let written = write_json_atomic(&self.path, &snapshot).await;
        if let Err(err) = written {
            // Keep memory in line with what is on disk.
            match previous {
                Some(previous) => records.insert(record.order_id.clone(), previous),
                None => records.remove(&record.order_id),
            };
            return Err(err);
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<RoutingRecord>> {
        Ok(self.records.lock().await.values().cloned().collect())
    }
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryRoutingStore {
    records: Arc<Mutex<BTreeMap<OrderId, RoutingRecord>>>,
}

impl InMemoryRoutingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RoutingStore for InMemoryRoutingStore {
    async fn get(&self, order_id: &OrderId) -> Result<Option<RoutingRecord>> {
        Ok(self.records.lock().await.get(order_id).cloned())
    }

    async fn upsert(&self, record: &RoutingRecord) -> Result<()> {
        self.records
            .lock()
            .await
            .insert(record.order_id.clone(), record.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<RoutingRecord>> {
        Ok(self.records.lock().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::RoutingState;
    use crate::types::{ResourceRef, ResourceRequirements, ResourceSpec, ProviderAddress};

    fn spec(id: &str) -> ResourceSpec {
        ResourceSpec {
            order_id: OrderId::new(id),
            tenant: ProviderAddress("tenant".into()),
            requirements: ResourceRequirements {
                cpu_millis: 500,
                memory_mb: 256,
                ..Default::default()
            },
            manifest: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("routing.json");

        let store = FileRoutingStore::open(&path).await.expect("open");
        let mut record = RoutingRecord::pending(spec("o-1"));
        store.upsert(&record).await.expect("pending");
        record.state = RoutingState::Routed;
        record.external_resource_ref = Some(ResourceRef::new("res-o-1"));
        store.upsert(&record).await.expect("routed");
        store
            .upsert(&RoutingRecord::pending(spec("o-2")))
            .await
            .expect("second");

        let reopened = FileRoutingStore::open(&path).await.expect("reopen");
        let all = reopened.list().await.expect("list");
        assert_eq!(all.len(), 2);
        let first = reopened
            .get(&OrderId::new("o-1"))
            .await
            .expect("get")
            .expect("present");
        assert_eq!(first.state, RoutingState::Routed);
        assert_eq!(first.external_resource_ref, Some(ResourceRef::new("res-o-1")));
    }
}
