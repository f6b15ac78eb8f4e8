//! Crash-safe file replacement shared by the file-backed stores.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::warn;

use crate::error::{LessorError, Result};

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
///
/// The payload is written to a temp file in the destination directory,
/// flushed to disk and renamed over the target, so readers observe either the
/// old or the new content and never a torn write.
pub async fn write_json_atomic<T>(path: &Path, value: &T) -> Result<()>
where
    T: Serialize + ?Sized,
{
    let bytes = serde_json::to_vec_pretty(value)?;
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || replace_file(&path, &bytes))
        .await
        .map_err(|err| LessorError::Fatal(format!("atomic write task panicked: {err}")))?
}

fn replace_file(path: &PathBuf, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let mut tmp = NamedTempFile::new_in(&dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| LessorError::Io(err.error))?;

    // Make the rename itself durable where the platform allows it.
    #[cfg(unix)]
    if let Err(err) = std::fs::File::open(&dir).and_then(|handle| handle.sync_all()) {
        warn!(
            target: "lessor::persist",
            dir = %dir.display(),
            error = %err,
            "directory sync after rename failed"
        );
    }
    Ok(())
}

/// Read a JSON file, returning `None` when it does not exist.
pub async fn read_json<T>(path: &Path) -> Result<Option<T>>
where
    T: serde::de::DeserializeOwned,
{
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let value = serde_json::from_slice(&bytes).map_err(|err| {
                LessorError::Fatal(format!("corrupt state file {}: {err}", path.display()))
            })?;
            Ok(Some(value))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(LessorError::Io(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replaces_the_file_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("nested");
        let path = nested.join("state.json");

        write_json_atomic(&path, &vec![1u32, 2]).await.expect("first write");
        write_json_atomic(&path, &vec![3u32]).await.expect("replace");

        let read: Option<Vec<u32>> = read_json(&path).await.expect("read");
        assert_eq!(read, Some(vec![3]));
        assert_eq!(std::fs::read_dir(&nested).expect("dir").count(), 1);
        let missing: Option<Vec<u32>> = read_json(&nested.join("absent.json")).await.expect("read");
        assert!(missing.is_none());
    }
}
