//! Event store abstraction.
//!
//! An event store is an append-only log partitioned into streams, one per
//! aggregate. Appends are conflict-checked against the caller's expected
//! version and are all-or-nothing. Every backend implements the same
//! contract; the shared planning logic lives here so backends only differ
//! in how they read current versions and persist a planned batch.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::EventStoreError;
use crate::event::{NewEvent, RecordedEvent};
use crate::notify::{Channel, NotificationHub, Subscription};

/// The stream version an append expects to find.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpectedVersion {
    /// Skip the concurrency check.
    Any,
    /// The stream must be empty.
    #[default]
    NoStream,
    /// The stream must be exactly at this version.
    Exact(u64),
}

impl ExpectedVersion {
    /// Maps the nullable wire form: `None` disables the check.
    #[must_use]
    pub fn from_option(version: Option<u64>) -> Self {
        version.map_or(Self::Any, Self::Exact)
    }

    /// The version this expectation pins, if any.
    #[must_use]
    pub fn as_version(self) -> Option<u64> {
        match self {
            Self::Any => None,
            Self::NoStream => Some(0),
            Self::Exact(v) => Some(v),
        }
    }

    /// Checks the expectation against the stream's persisted version.
    ///
    /// # Errors
    ///
    /// Returns `EventStoreError::VersionConflict` on mismatch.
    pub fn check(self, stream_id: &str, actual: u64) -> Result<(), EventStoreError> {
        match self.as_version() {
            Some(expected) if expected != actual => Err(EventStoreError::VersionConflict {
                stream_id: stream_id.to_owned(),
                expected,
                actual,
            }),
            _ => Ok(()),
        }
    }
}

impl From<u64> for ExpectedVersion {
    fn from(version: u64) -> Self {
        Self::Exact(version)
    }
}

/// One stream's share of an atomic batch append.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamAppend {
    /// Target stream.
    pub stream_id: String,
    /// Version the stream must be at before this append.
    pub expected_version: ExpectedVersion,
    /// Events to append, in order.
    pub events: Vec<NewEvent>,
}

impl StreamAppend {
    /// Creates a stream append.
    #[must_use]
    pub fn new(
        stream_id: impl Into<String>,
        expected_version: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            expected_version,
            events,
        }
    }
}

/// Validates a batch against current stream versions and assigns sequence
/// numbers. Nothing is written; if any stream conflicts the whole batch is
/// rejected. A stream may appear more than once; later entries are checked
/// against the version left by earlier ones.
///
/// # Errors
///
/// Returns `EventStoreError::VersionConflict` for the first stream whose
/// expectation does not hold.
pub fn plan_batch<F>(
    batch: &[StreamAppend],
    mut current_version: F,
) -> Result<Vec<RecordedEvent>, EventStoreError>
where
    F: FnMut(&str) -> u64,
{
    let mut running: HashMap<&str, u64> = HashMap::new();
    let mut planned = Vec::with_capacity(batch.iter().map(|a| a.events.len()).sum());
    for append in batch {
        let stream_id = append.stream_id.as_str();
        let version = *running
            .entry(stream_id)
            .or_insert_with(|| current_version(stream_id));
        append.expected_version.check(stream_id, version)?;
        let mut next = version;
        for event in &append.events {
            next += 1;
            planned.push(event.clone().record(stream_id, next));
        }
        running.insert(stream_id, next);
    }
    Ok(planned)
}

/// Returns `true` if `event` falls inside the inclusive sequence range.
#[must_use]
pub fn in_range(event: &RecordedEvent, from_version: u64, to_version: Option<u64>) -> bool {
    event.sequence_number >= from_version && to_version.is_none_or(|to| event.sequence_number <= to)
}

/// Returns `true` if `event` occurred at or after `since`.
#[must_use]
pub fn occurred_since(event: &RecordedEvent, since: Option<DateTime<Utc>>) -> bool {
    since.is_none_or(|s| event.occurred_on >= s)
}

/// Store contract for loading and appending events.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends `events` to `stream_id`, assigning sequence numbers from the
    /// stream's current version + 1. Rejects the append without writing if
    /// the current version does not match `expected_version`. Returns the
    /// recorded events once they are durably visible to reads.
    async fn append(
        &self,
        stream_id: &str,
        events: &[NewEvent],
        expected_version: ExpectedVersion,
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        self.append_batch(&[StreamAppend::new(
            stream_id,
            expected_version,
            events.to_vec(),
        )])
        .await
    }

    /// Appends to several streams atomically: either every stream's check
    /// passes and every event is written, or nothing is written.
    async fn append_batch(
        &self,
        batch: &[StreamAppend],
    ) -> Result<Vec<RecordedEvent>, EventStoreError>;

    /// Loads events of `stream_id` with `from_version <= sequence_number <=
    /// to_version`, ascending. An unknown stream yields an empty list.
    async fn get_events(
        &self,
        stream_id: &str,
        from_version: u64,
        to_version: Option<u64>,
    ) -> Result<Vec<RecordedEvent>, EventStoreError>;

    /// Current persisted version of `stream_id` (0 for an unknown stream).
    async fn stream_version(&self, stream_id: &str) -> Result<u64, EventStoreError>;

    /// Cross-stream scan by event discriminator, in append order.
    async fn get_events_by_type(
        &self,
        event_type: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RecordedEvent>, EventStoreError>;

    /// Cross-stream scan by aggregate type, in append order.
    async fn get_events_by_aggregate_type(
        &self,
        aggregate_type: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RecordedEvent>, EventStoreError>;

    /// Notification hub, for backends that publish appends.
    fn notifications(&self) -> Option<&NotificationHub> {
        None
    }

    /// Subscribes to appended events on `channel`.
    fn subscribe(&self, channel: Channel) -> Option<Subscription> {
        self.notifications().map(|hub| hub.subscribe(channel))
    }
}
