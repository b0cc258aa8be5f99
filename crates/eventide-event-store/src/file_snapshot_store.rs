//! Directory-backed snapshot store.
//!
//! Each aggregate's latest snapshot is one JSON file named after the
//! hex-encoded aggregate id. Writes go to a temporary file that is synced
//! and renamed over the previous snapshot.

use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use eventide_core::error::SnapshotError;
use eventide_core::snapshot::{Snapshot, SnapshotStore, usable_snapshot};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Snapshot store keeping one file per aggregate under a directory.
#[derive(Debug)]
pub struct FileSnapshotStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSnapshotStore {
    /// Opens `dir`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns `SnapshotError::Storage` if the directory cannot be created.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, SnapshotError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await.map_err(storage_error)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, aggregate_id: &str) -> PathBuf {
        let mut name = String::with_capacity(aggregate_id.len() * 2 + 5);
        for byte in aggregate_id.as_bytes() {
            let _ = write!(name, "{byte:02x}");
        }
        name.push_str(".json");
        self.dir.join(name)
    }

    async fn read(&self, aggregate_id: &str) -> Result<Option<Snapshot>, SnapshotError> {
        let path = self.path_for(aggregate_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(storage_error(e)),
        };
        match serde_json::from_slice(&bytes) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable snapshot file");
                Ok(None)
            }
        }
    }
}

fn storage_error(e: io::Error) -> SnapshotError {
    SnapshotError::Storage(e.to_string())
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        let _guard = self.write_lock.lock().await;
        if let Some(existing) = self.read(&snapshot.aggregate_id).await?
            && existing.version > snapshot.version
        {
            tracing::debug!(
                aggregate_id = %snapshot.aggregate_id,
                stored = existing.version,
                offered = snapshot.version,
                "keeping newer snapshot"
            );
            return Ok(());
        }

        let bytes = serde_json::to_vec(snapshot)
            .map_err(|e| SnapshotError::Serialization(e.to_string()))?;
        let path = self.path_for(&snapshot.aggregate_id);
        let tmp = path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp).await.map_err(storage_error)?;
        file.write_all(&bytes).await.map_err(storage_error)?;
        file.sync_all().await.map_err(storage_error)?;
        drop(file);
        tokio::fs::rename(&tmp, &path).await.map_err(storage_error)?;
        tracing::debug!(
            aggregate_id = %snapshot.aggregate_id,
            version = snapshot.version,
            "saved snapshot"
        );
        Ok(())
    }

    async fn get_snapshot(
        &self,
        aggregate_id: &str,
        aggregate_type: &str,
    ) -> Result<Option<Snapshot>, SnapshotError> {
        let candidate = self
            .read(aggregate_id)
            .await?
            .filter(|s| s.aggregate_id == aggregate_id);
        Ok(usable_snapshot(candidate, aggregate_type))
    }

    async fn delete_snapshot(&self, aggregate_id: &str) -> Result<(), SnapshotError> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(self.path_for(aggregate_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_error(e)),
        }
    }
}
