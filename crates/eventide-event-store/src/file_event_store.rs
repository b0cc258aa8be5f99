//! Append-only file event store.
//!
//! Every successful append writes one JSON line holding a commit record
//! with all events of the batch, then syncs the file before the events
//! become visible. A batch is therefore durable as a whole or not at all.
//! On open the log is replayed into an in-memory index. A torn final line
//! left by a crash is truncated away; a damaged line anywhere before it
//! fails the open.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eventide_core::error::EventStoreError;
use eventide_core::event::RecordedEvent;
use eventide_core::notify::NotificationHub;
use eventide_core::store::{EventStore, StreamAppend, occurred_since};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::in_memory::StreamLog;

/// One line of the log file.
#[derive(Debug, Serialize, Deserialize)]
struct CommitRecord {
    commit_id: Uuid,
    committed_at: DateTime<Utc>,
    events: Vec<RecordedEvent>,
}

#[derive(Debug)]
struct CommitWriter {
    file: File,
    len: u64,
}

#[derive(Debug)]
struct LogState {
    path: PathBuf,
    log: RwLock<StreamLog>,
    writer: Mutex<CommitWriter>,
    hub: NotificationHub,
}

/// Event store persisted to a single append-only JSON-lines file.
#[derive(Debug)]
pub struct FileEventStore {
    state: Arc<LogState>,
}

impl FileEventStore {
    /// Opens the log at `path`, creating it and its parent directory if
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns `EventStoreError::Read` if the file cannot be read or
    /// repaired, and `EventStoreError::Corrupt` if a complete record is
    /// malformed or out of sequence.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, EventStoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(read_error)?;
        }

        let contents = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(read_error(e)),
        };
        let (log, valid_len) = load_log(&contents).inspect_err(|e| {
            tracing::error!(error = %e, path = %path.display(), "refusing to open event log");
        })?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(read_error)?;
        if valid_len < contents.len() {
            tracing::warn!(
                path = %path.display(),
                discarded_bytes = contents.len() - valid_len,
                "truncating torn tail of event log"
            );
            file.set_len(valid_len as u64).await.map_err(read_error)?;
            file.sync_all().await.map_err(read_error)?;
        }
        tracing::info!(path = %path.display(), events = log.len(), "opened event log");

        Ok(Self {
            state: Arc::new(LogState {
                path,
                log: RwLock::new(log),
                writer: Mutex::new(CommitWriter {
                    file,
                    len: valid_len as u64,
                }),
                hub: NotificationHub::default(),
            }),
        })
    }

    /// Location of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.state.path
    }
}

impl LogState {
    async fn commit(&self, batch: &[StreamAppend]) -> Result<Vec<RecordedEvent>, EventStoreError> {
        let mut writer = self.writer.lock().await;
        let planned = self.log.read().plan(batch)?;
        if planned.is_empty() {
            return Ok(planned);
        }

        let record = CommitRecord {
            commit_id: Uuid::now_v7(),
            committed_at: Utc::now(),
            events: planned,
        };
        let mut line = serde_json::to_vec(&record)
            .map_err(|e| EventStoreError::Serialization(e.to_string()))?;
        line.push(b'\n');

        let written = async {
            writer.file.write_all(&line).await?;
            writer.file.sync_data().await
        }
        .await;
        if let Err(e) = written {
            tracing::error!(error = %e, path = %self.path.display(), "event log write failed");
            let len = writer.len;
            if let Err(repair) = writer.file.set_len(len).await {
                tracing::error!(error = %repair, "failed to roll back partial event log write");
            }
            return Err(append_error(e));
        }
        writer.len += line.len() as u64;
        self.log.write().extend(&record.events);
        drop(writer);

        tracing::debug!(
            commit_id = %record.commit_id,
            events = record.events.len(),
            "committed events to log"
        );
        self.hub.publish(&record.events);
        Ok(record.events)
    }
}

/// Replays every newline-terminated commit record. Bytes after the last
/// newline are a torn write and are left out of the valid prefix. Returns
/// the index and the byte length of the valid prefix.
fn load_log(contents: &[u8]) -> Result<(StreamLog, usize), EventStoreError> {
    let mut log = StreamLog::default();
    let mut valid_len = 0;
    let mut line_number = 0;
    let mut rest = contents;
    while let Some(newline) = rest.iter().position(|&b| b == b'\n') {
        line_number += 1;
        let line = &rest[..newline];
        if !line.is_empty() {
            let record = serde_json::from_slice::<CommitRecord>(line).map_err(|e| {
                EventStoreError::Corrupt(format!(
                    "line {line_number} at byte {valid_len} is malformed: {e}"
                ))
            })?;
            if !accepts_commit(&log, &record.events) {
                return Err(EventStoreError::Corrupt(format!(
                    "line {line_number} at byte {valid_len} is out of sequence"
                )));
            }
            log.extend(&record.events);
        }
        valid_len += newline + 1;
        rest = &rest[newline + 1..];
    }
    Ok((log, valid_len))
}

fn accepts_commit(log: &StreamLog, events: &[RecordedEvent]) -> bool {
    let mut scratch = StreamLog::default();
    events.iter().all(|event| {
        let base = log.version(&event.aggregate_id) + scratch.version(&event.aggregate_id);
        let ok = event.sequence_number == base + 1;
        scratch.extend(std::slice::from_ref(event));
        ok
    })
}

fn read_error(e: io::Error) -> EventStoreError {
    EventStoreError::Read(e.to_string())
}

fn append_error(e: io::Error) -> EventStoreError {
    EventStoreError::Append(e.to_string())
}

#[async_trait]
impl EventStore for FileEventStore {
    /// The commit runs on its own task so a caller that stops waiting
    /// cannot leave the file ahead of the index.
    async fn append_batch(
        &self,
        batch: &[StreamAppend],
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        let state = Arc::clone(&self.state);
        let batch = batch.to_vec();
        tokio::spawn(async move { state.commit(&batch).await })
            .await
            .map_err(|e| EventStoreError::Append(format!("commit task failed: {e}")))?
    }

    async fn get_events(
        &self,
        stream_id: &str,
        from_version: u64,
        to_version: Option<u64>,
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        Ok(self.state.log.read().stream(stream_id, from_version, to_version))
    }

    async fn stream_version(&self, stream_id: &str) -> Result<u64, EventStoreError> {
        Ok(self.state.log.read().version(stream_id))
    }

    async fn get_events_by_type(
        &self,
        event_type: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        Ok(self
            .state
            .log
            .read()
            .scan(|e| e.event_type == event_type && occurred_since(e, since)))
    }

    async fn get_events_by_aggregate_type(
        &self,
        aggregate_type: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        Ok(self
            .state
            .log
            .read()
            .scan(|e| e.aggregate_type == aggregate_type && occurred_since(e, since)))
    }

    fn notifications(&self) -> Option<&NotificationHub> {
        Some(&self.state.hub)
    }
}
