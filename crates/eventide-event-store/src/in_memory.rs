//! In-memory event and snapshot stores.
//!
//! The in-memory store is the reference implementation of the store
//! contract. The file-backed store reuses its [`StreamLog`] index and only
//! adds durability in front of it.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eventide_core::error::{EventStoreError, SnapshotError};
use eventide_core::event::RecordedEvent;
use eventide_core::notify::NotificationHub;
use eventide_core::snapshot::{Snapshot, SnapshotStore, usable_snapshot};
use eventide_core::store::{
    EventStore, StreamAppend, in_range, occurred_since, plan_batch,
};
use parking_lot::RwLock;

/// Append-ordered event log with a per-stream index.
#[derive(Debug, Default)]
pub(crate) struct StreamLog {
    events: Vec<RecordedEvent>,
    streams: HashMap<String, Vec<usize>>,
}

impl StreamLog {
    pub(crate) fn version(&self, stream_id: &str) -> u64 {
        self.streams.get(stream_id).map_or(0, |s| s.len() as u64)
    }

    /// Plans `batch` against the current versions without mutating.
    pub(crate) fn plan(&self, batch: &[StreamAppend]) -> Result<Vec<RecordedEvent>, EventStoreError> {
        plan_batch(batch, |stream_id| self.version(stream_id))
    }

    /// Adds already-planned events. Callers guarantee contiguity.
    pub(crate) fn extend(&mut self, events: &[RecordedEvent]) {
        for event in events {
            let position = self.events.len();
            self.events.push(event.clone());
            self.streams
                .entry(event.aggregate_id.clone())
                .or_default()
                .push(position);
        }
    }

    pub(crate) fn stream(
        &self,
        stream_id: &str,
        from_version: u64,
        to_version: Option<u64>,
    ) -> Vec<RecordedEvent> {
        self.streams
            .get(stream_id)
            .map(|positions| {
                positions
                    .iter()
                    .map(|&p| &self.events[p])
                    .filter(|e| in_range(e, from_version, to_version))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn scan<P>(&self, predicate: P) -> Vec<RecordedEvent>
    where
        P: Fn(&RecordedEvent) -> bool,
    {
        self.events.iter().filter(|e| predicate(e)).cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.events.len()
    }
}

/// Process-local event store.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    log: RwLock<StreamLog>,
    hub: NotificationHub,
}

impl InMemoryEventStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored events across all streams.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.log.read().len()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append_batch(
        &self,
        batch: &[StreamAppend],
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        let recorded = {
            let mut log = self.log.write();
            let planned = log.plan(batch).inspect_err(|e| {
                tracing::debug!(error = %e, "in-memory append rejected");
            })?;
            log.extend(&planned);
            planned
        };
        tracing::debug!(events = recorded.len(), streams = batch.len(), "appended events");
        self.hub.publish(&recorded);
        Ok(recorded)
    }

    async fn get_events(
        &self,
        stream_id: &str,
        from_version: u64,
        to_version: Option<u64>,
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        Ok(self.log.read().stream(stream_id, from_version, to_version))
    }

    async fn stream_version(&self, stream_id: &str) -> Result<u64, EventStoreError> {
        Ok(self.log.read().version(stream_id))
    }

    async fn get_events_by_type(
        &self,
        event_type: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        Ok(self
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
            .log
            .read()
            .scan(|e| e.aggregate_type == aggregate_type && occurred_since(e, since)))
    }

    fn notifications(&self) -> Option<&NotificationHub> {
        Some(&self.hub)
    }
}

/// Process-local snapshot store keeping the latest snapshot per aggregate.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: RwLock<HashMap<String, Snapshot>>,
}

impl InMemorySnapshotStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        let mut snapshots = self.snapshots.write();
        let newer = snapshots
            .get(&snapshot.aggregate_id)
            .is_none_or(|existing| existing.version <= snapshot.version);
        if newer {
            snapshots.insert(snapshot.aggregate_id.clone(), snapshot.clone());
        }
        Ok(())
    }

    async fn get_snapshot(
        &self,
        aggregate_id: &str,
        aggregate_type: &str,
    ) -> Result<Option<Snapshot>, SnapshotError> {
        let candidate = self.snapshots.read().get(aggregate_id).cloned();
        Ok(usable_snapshot(candidate, aggregate_type))
    }

    async fn delete_snapshot(&self, aggregate_id: &str) -> Result<(), SnapshotError> {
        self.snapshots.write().remove(aggregate_id);
        Ok(())
    }
}
