//! Dead-letter storage backends.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use super::DeadLetterEvent;
use crate::error::DeadLetterError;

/// Persistence for dead-letter entries.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Adds an entry.
    async fn insert(&self, entry: DeadLetterEvent) -> Result<(), DeadLetterError>;

    /// Replaces the entry with the same id. Missing entries are ignored.
    async fn update(&self, entry: &DeadLetterEvent) -> Result<(), DeadLetterError>;

    /// Removes an entry, returning whether it existed.
    async fn remove(&self, id: Uuid) -> Result<bool, DeadLetterError>;

    /// Looks up one entry.
    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterEvent>, DeadLetterError>;

    /// All entries, oldest first.
    async fn list(&self) -> Result<Vec<DeadLetterEvent>, DeadLetterError>;

    /// Removes every entry, returning how many were removed.
    async fn clear(&self) -> Result<usize, DeadLetterError>;
}

fn sorted(mut entries: Vec<DeadLetterEvent>) -> Vec<DeadLetterEvent> {
    entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    entries
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterStore {
    entries: Mutex<Vec<DeadLetterEvent>>,
}

impl InMemoryDeadLetterStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn insert(&self, entry: DeadLetterEvent) -> Result<(), DeadLetterError> {
        self.entries.lock().push(entry);
        Ok(())
    }

    async fn update(&self, entry: &DeadLetterEvent) -> Result<(), DeadLetterError> {
        if let Some(slot) = self.entries.lock().iter_mut().find(|e| e.id == entry.id) {
            slot.clone_from(entry);
        }
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> Result<bool, DeadLetterError> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        Ok(entries.len() != before)
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterEvent>, DeadLetterError> {
        Ok(self.entries.lock().iter().find(|e| e.id == id).cloned())
    }

    async fn list(&self) -> Result<Vec<DeadLetterEvent>, DeadLetterError> {
        Ok(sorted(self.entries.lock().clone()))
    }

    async fn clear(&self) -> Result<usize, DeadLetterError> {
        Ok(std::mem::take(&mut *self.entries.lock()).len())
    }
}

/// Store kept as a single JSON document, rewritten atomically on every
/// change.
#[derive(Debug)]
pub struct FileDeadLetterStore {
    path: PathBuf,
    entries: tokio::sync::Mutex<Vec<DeadLetterEvent>>,
}

impl FileDeadLetterStore {
    /// Opens the store at `path`, creating it on first write.
    ///
    /// # Errors
    ///
    /// Returns `DeadLetterError::Storage` if the file exists but cannot be
    /// read or parsed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, DeadLetterError> {
        let path = path.as_ref().to_path_buf();
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => Vec::new(),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                DeadLetterError::Storage(format!("{}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(storage(&path, &e)),
        };
        Ok(Self {
            path,
            entries: tokio::sync::Mutex::new(entries),
        })
    }

    /// Path of the backing document.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, entries: &[DeadLetterEvent]) -> Result<(), DeadLetterError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| storage(parent, &e))?;
        }
        let bytes = serde_json::to_vec_pretty(entries)
            .map_err(|e| DeadLetterError::Storage(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await.map_err(|e| storage(&tmp, &e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| storage(&self.path, &e))
    }

    async fn mutate<R>(
        &self,
        change: impl FnOnce(&mut Vec<DeadLetterEvent>) -> R,
    ) -> Result<R, DeadLetterError> {
        let mut entries = self.entries.lock().await;
        let mut next = entries.clone();
        let result = change(&mut next);
        self.persist(&next).await?;
        *entries = next;
        Ok(result)
    }
}

fn storage(path: &Path, err: &std::io::Error) -> DeadLetterError {
    DeadLetterError::Storage(format!("{}: {err}", path.display()))
}

#[async_trait]
impl DeadLetterStore for FileDeadLetterStore {
    async fn insert(&self, entry: DeadLetterEvent) -> Result<(), DeadLetterError> {
        self.mutate(|entries| entries.push(entry)).await
    }

    async fn update(&self, entry: &DeadLetterEvent) -> Result<(), DeadLetterError> {
        self.mutate(|entries| {
            if let Some(slot) = entries.iter_mut().find(|e| e.id == entry.id) {
                slot.clone_from(entry);
            }
        })
        .await
    }

    async fn remove(&self, id: Uuid) -> Result<bool, DeadLetterError> {
        self.mutate(|entries| {
            let before = entries.len();
            entries.retain(|e| e.id != id);
            entries.len() != before
        })
        .await
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterEvent>, DeadLetterError> {
        Ok(self.entries.lock().await.iter().find(|e| e.id == id).cloned())
    }

    async fn list(&self) -> Result<Vec<DeadLetterEvent>, DeadLetterError> {
        Ok(sorted(self.entries.lock().await.clone()))
    }

    async fn clear(&self) -> Result<usize, DeadLetterError> {
        self.mutate(|entries| std::mem::take(entries).len()).await
    }
}
