//! Test event stores — `EventStore` doubles for tests.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eventide_core::error::EventStoreError;
use eventide_core::event::RecordedEvent;
use eventide_core::store::{EventStore, StreamAppend, in_range, occurred_since, plan_batch};

/// An event store that keeps events in a plain vector and records every
/// `append_batch` call, including rejected ones.
#[derive(Debug, Default)]
pub struct RecordingEventStore {
    events: Mutex<Vec<RecordedEvent>>,
    batches: Mutex<Vec<Vec<StreamAppend>>>,
}

impl RecordingEventStore {
    /// Create an empty recording store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with `events`, as if appended earlier.
    #[must_use]
    pub fn with_events(events: Vec<RecordedEvent>) -> Self {
        Self {
            events: Mutex::new(events),
            batches: Mutex::new(Vec::new()),
        }
    }

    /// Returns every batch passed to `append_batch`.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn appended_batches(&self) -> Vec<Vec<StreamAppend>> {
        self.batches.lock().unwrap().clone()
    }

    /// Returns all stored events in append order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn stored_events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    fn version_of(events: &[RecordedEvent], stream_id: &str) -> u64 {
        events
            .iter()
            .filter(|e| e.aggregate_id == stream_id)
            .map(|e| e.sequence_number)
            .max()
            .unwrap_or(0)
    }
}

#[async_trait]
impl EventStore for RecordingEventStore {
    async fn append_batch(
        &self,
        batch: &[StreamAppend],
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        self.batches.lock().unwrap().push(batch.to_vec());
        let mut events = self.events.lock().unwrap();
        let planned = plan_batch(batch, |stream_id| Self::version_of(&events, stream_id))?;
        events.extend(planned.iter().cloned());
        Ok(planned)
    }

    async fn get_events(
        &self,
        stream_id: &str,
        from_version: u64,
        to_version: Option<u64>,
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        let mut selected: Vec<RecordedEvent> = self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.aggregate_id == stream_id && in_range(e, from_version, to_version))
            .cloned()
            .collect();
        selected.sort_by_key(|e| e.sequence_number);
        Ok(selected)
    }

    async fn stream_version(&self, stream_id: &str) -> Result<u64, EventStoreError> {
        Ok(Self::version_of(&self.events.lock().unwrap(), stream_id))
    }

    async fn get_events_by_type(
        &self,
        event_type: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type == event_type && occurred_since(e, since))
            .cloned()
            .collect())
    }

    async fn get_events_by_aggregate_type(
        &self,
        aggregate_type: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.aggregate_type == aggregate_type && occurred_since(e, since))
            .cloned()
            .collect())
    }
}

/// An event store whose every operation fails with a backend error. Useful
/// for testing error-handling paths.
#[derive(Debug)]
pub struct FailingEventStore;

#[async_trait]
impl EventStore for FailingEventStore {
    async fn append_batch(
        &self,
        _batch: &[StreamAppend],
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        Err(EventStoreError::Append("connection refused".into()))
    }

    async fn get_events(
        &self,
        _stream_id: &str,
        _from_version: u64,
        _to_version: Option<u64>,
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        Err(EventStoreError::Read("connection refused".into()))
    }

    async fn stream_version(&self, _stream_id: &str) -> Result<u64, EventStoreError> {
        Err(EventStoreError::Read("connection refused".into()))
    }

    async fn get_events_by_type(
        &self,
        _event_type: &str,
        _since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        Err(EventStoreError::Read("connection refused".into()))
    }

    async fn get_events_by_aggregate_type(
        &self,
        _aggregate_type: &str,
        _since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        Err(EventStoreError::Read("connection refused".into()))
    }
}
