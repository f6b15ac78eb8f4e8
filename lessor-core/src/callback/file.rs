use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{CallbackResult, CallbackSink};
use crate::error::Result;

#[derive(Serialize)]
struct Line<'a> {
    at: DateTime<Utc>,
    #[serde(flatten)]
    result: &'a CallbackResult,
}

/// Appends one JSON object per outcome to a local file. Used for dry runs and
/// for deployments where a separate relayer posts results.
#[derive(Debug)]
pub struct FileCallbackSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileCallbackSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CallbackSink for FileCallbackSink {
    async fn submit(&self, result: &CallbackResult) -> Result<()> {
        let mut line = serde_json::to_vec(&Line {
            at: Utc::now(),
            result,
        })?;
        line.push(b'\n');

        let _held = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderId, ResourceRef};

    #[tokio::test]
    async fn appends_one_json_line_per_outcome() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = FileCallbackSink::new(dir.path().join("out/results.jsonl"));

        sink.submit(&CallbackResult::RoutingFailed {
            order_id: OrderId::new("o-2"),
            attempts: 3,
            error: "backend down".into(),
        })
        .await
        .expect("first");
        sink.submit(&CallbackResult::LifecycleConfirmed {
            command_id: crate::types::CommandId::new(),
            resource_ref: ResourceRef::new("res-1"),
            action: crate::types::LifecycleAction::Suspend,
            order_id: None,
            request_nonce: "n1".into(),
        })
        .await
        .expect("second");

        let raw = std::fs::read_to_string(sink.path()).expect("read");
        let lines: Vec<serde_json::Value> = raw
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["kind"], "routing_failed");
        assert_eq!(lines[1]["action"], "suspend");
    }
}
