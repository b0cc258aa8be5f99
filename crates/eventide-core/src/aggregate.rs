//! Aggregate root abstraction.
//!
//! An aggregate is an entity whose state is derived only by applying its
//! events. Domain code implements [`AggregateState`]: a serializable state
//! type with an exhaustive `transition` over its event enum. [`Aggregate`]
//! wraps that state with identity, version and the queue of pending events.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{AggregateError, SnapshotError};
use crate::event::{DomainEvent, EventMetadata, NewEvent, RecordedEvent};
use crate::snapshot::Snapshot;

/// State of an event-sourced aggregate.
pub trait AggregateState:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + std::fmt::Debug + 'static
{
    /// The event type this aggregate produces and consumes.
    type Event: DomainEvent;

    /// Aggregate type name, recorded with events and snapshots.
    const AGGREGATE_TYPE: &'static str;

    /// Applies one event to the state. Must be deterministic.
    fn transition(&mut self, event: &Self::Event);
}

/// An event applied in memory but not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEvent<E> {
    /// Identifier the event will be stored under.
    pub event_id: Uuid,
    /// The typed event.
    pub event: E,
    /// Creation timestamp.
    pub occurred_on: DateTime<Utc>,
    /// Metadata to store with the event.
    pub metadata: EventMetadata,
}

impl<E: DomainEvent> PendingEvent<E> {
    /// Encodes the pending event for an append.
    ///
    /// # Errors
    ///
    /// Returns `AggregateError::Serialization` if the payload cannot be
    /// encoded.
    pub fn to_new_event(&self, aggregate_type: &str) -> Result<NewEvent, AggregateError> {
        let event_type = self.event.event_type();
        let payload = self
            .event
            .to_payload()
            .map_err(|e| AggregateError::Serialization {
                event_type: event_type.to_owned(),
                reason: e.to_string(),
            })?;
        Ok(
            NewEvent::new(aggregate_type, event_type, payload, self.occurred_on)
                .with_event_id(self.event_id)
                .with_schema_version(self.event.schema_version())
                .with_metadata(self.metadata.clone()),
        )
    }
}

/// Decodes a recorded event into the typed event set of `S`.
///
/// # Errors
///
/// Returns `AggregateError::UnhandledEvent` for discriminators outside the
/// set and `AggregateError::Deserialization` for malformed payloads.
pub fn decode_event<S: AggregateState>(
    recorded: &RecordedEvent,
) -> Result<S::Event, AggregateError> {
    if !<S::Event as DomainEvent>::handles(&recorded.event_type) {
        return Err(AggregateError::UnhandledEvent {
            aggregate_type: S::AGGREGATE_TYPE,
            event_type: recorded.event_type.clone(),
        });
    }
    <S::Event as DomainEvent>::from_payload(&recorded.event_type, recorded.payload.clone()).map_err(|e| {
        AggregateError::Deserialization {
            event_type: recorded.event_type.clone(),
            reason: e.to_string(),
        }
    })
}

/// An aggregate instance: identity, version, state and pending events.
///
/// Instances are owned by one caller at a time. Concurrent writers in other
/// tasks or processes are arbitrated by the store's version check, not by
/// locking here.
#[derive(Debug, Clone)]
pub struct Aggregate<S: AggregateState> {
    id: String,
    version: u64,
    state: S,
    pending: Vec<PendingEvent<S::Event>>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    snapshot_version: u64,
}

impl<S: AggregateState> Aggregate<S> {
    /// Creates an empty aggregate at version 0.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: 0,
            state: S::default(),
            pending: Vec::new(),
            created_at: None,
            updated_at: None,
            snapshot_version: 0,
        }
    }

    /// Returns the aggregate identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Highest applied sequence number, including pending events.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Version as last persisted: `version()` minus pending events.
    #[must_use]
    pub fn committed_version(&self) -> u64 {
        self.version - self.pending.len() as u64
    }

    /// Version of the snapshot this instance was seeded from (0 if none).
    #[must_use]
    pub fn snapshot_version(&self) -> u64 {
        self.snapshot_version
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> &S {
        &self.state
    }

    /// Timestamp of the first applied event.
    #[must_use]
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    /// Timestamp of the latest applied event.
    #[must_use]
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    /// Events applied since the last commit.
    #[must_use]
    pub fn pending_events(&self) -> &[PendingEvent<S::Event>] {
        &self.pending
    }

    /// Applies a new event: runs the state transition, increments the
    /// version and queues the event for persistence.
    pub fn apply(&mut self, event: S::Event, clock: &dyn Clock) {
        self.apply_with_metadata(event, EventMetadata::new(), clock);
    }

    /// [`Aggregate::apply`] with metadata attached to the stored event.
    pub fn apply_with_metadata(
        &mut self,
        event: S::Event,
        metadata: EventMetadata,
        clock: &dyn Clock,
    ) {
        let occurred_on = clock.now();
        self.state.transition(&event);
        self.version += 1;
        self.touch(occurred_on);
        self.pending.push(PendingEvent {
            event_id: Uuid::new_v4(),
            event,
            occurred_on,
            metadata,
        });
    }

    /// Runs a decision against the current state and applies every event it
    /// returns, in order. Nothing is applied if the decision fails.
    ///
    /// # Errors
    ///
    /// Returns the decision's error unchanged.
    pub fn execute<F, E>(&mut self, clock: &dyn Clock, decide: F) -> Result<usize, E>
    where
        F: FnOnce(&S) -> Result<Vec<S::Event>, E>,
    {
        let events = decide(&self.state)?;
        let count = events.len();
        for event in events {
            self.apply(event, clock);
        }
        Ok(count)
    }

    /// Returns and clears the pending queue.
    pub fn collect_pending(&mut self) -> Vec<PendingEvent<S::Event>> {
        std::mem::take(&mut self.pending)
    }

    /// Encodes and clears the pending queue.
    ///
    /// # Errors
    ///
    /// Returns `AggregateError::Serialization` if any payload fails to
    /// encode; the queue is left untouched in that case.
    pub fn take_new_events(&mut self) -> Result<Vec<NewEvent>, AggregateError> {
        let encoded = self
            .pending
            .iter()
            .map(|p| p.to_new_event(S::AGGREGATE_TYPE))
            .collect::<Result<Vec<_>, _>>()?;
        self.pending.clear();
        Ok(encoded)
    }

    /// Rebuilds an aggregate from its full history.
    ///
    /// Events are applied in `sequence_number` order and must be contiguous
    /// from 1.
    ///
    /// # Errors
    ///
    /// Returns `AggregateError::UnhandledEvent` if an event has no
    /// transition, and other `AggregateError`s for malformed histories.
    pub fn from_events(
        id: impl Into<String>,
        events: &[RecordedEvent],
    ) -> Result<Self, AggregateError> {
        let mut aggregate = Self::new(id);
        aggregate.replay_all(events)?;
        Ok(aggregate)
    }

    /// Seeds an aggregate from a snapshot. The snapshot must be followed by
    /// a replay of the events recorded after it.
    ///
    /// # Errors
    ///
    /// Returns `AggregateError::Snapshot` if the snapshot is for another
    /// aggregate type or cannot be decoded.
    pub fn from_snapshot(snapshot: &Snapshot) -> Result<Self, AggregateError> {
        if snapshot.aggregate_type != S::AGGREGATE_TYPE {
            return Err(SnapshotError::Serialization(format!(
                "snapshot type {} does not match {}",
                snapshot.aggregate_type,
                S::AGGREGATE_TYPE
            ))
            .into());
        }
        let state: S = snapshot.decode()?;
        Ok(Self {
            id: snapshot.aggregate_id.clone(),
            version: snapshot.version,
            state,
            pending: Vec::new(),
            created_at: None,
            updated_at: Some(snapshot.created_at),
            snapshot_version: snapshot.version,
        })
    }

    /// Captures the current state (including pending events) as a snapshot
    /// at `version()`.
    ///
    /// # Errors
    ///
    /// Returns `SnapshotError::Serialization` if the state cannot be
    /// encoded.
    pub fn to_snapshot(&self, clock: &dyn Clock) -> Result<Snapshot, SnapshotError> {
        Snapshot::capture(
            self.id.clone(),
            S::AGGREGATE_TYPE,
            self.version,
            &self.state,
            clock.now(),
        )
    }

    /// Records that a snapshot at `version` now exists.
    pub fn mark_snapshot(&mut self, version: u64) {
        self.snapshot_version = self.snapshot_version.max(version.min(self.version));
    }

    /// Applies persisted events in sequence order.
    ///
    /// # Errors
    ///
    /// See [`Aggregate::replay`].
    pub fn replay_all(&mut self, events: &[RecordedEvent]) -> Result<(), AggregateError> {
        let mut ordered: Vec<&RecordedEvent> = events.iter().collect();
        ordered.sort_by_key(|e| e.sequence_number);
        for event in ordered {
            self.replay(event)?;
        }
        Ok(())
    }

    /// Applies one persisted event without queueing it. The event must be
    /// the next one in the stream.
    ///
    /// # Errors
    ///
    /// Returns `AggregateError::PendingEvents` if uncommitted events are
    /// queued, `StreamMismatch` or `SequenceGap` for misplaced events, and
    /// decode errors from [`decode_event`].
    pub fn replay(&mut self, recorded: &RecordedEvent) -> Result<(), AggregateError> {
        if !self.pending.is_empty() {
            return Err(AggregateError::PendingEvents(self.id.clone()));
        }
        if recorded.aggregate_id != self.id {
            return Err(AggregateError::StreamMismatch {
                expected: self.id.clone(),
                actual: recorded.aggregate_id.clone(),
            });
        }
        let expected = self.version + 1;
        if recorded.sequence_number != expected {
            return Err(AggregateError::SequenceGap {
                aggregate_id: self.id.clone(),
                expected,
                actual: recorded.sequence_number,
            });
        }
        let event = decode_event::<S>(recorded)?;
        self.state.transition(&event);
        self.version = recorded.sequence_number;
        self.touch(recorded.occurred_on);
        Ok(())
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        if self.created_at.is_none() && self.version == 1 {
            self.created_at = Some(at);
        }
        self.updated_at = Some(at);
    }
}

/// Object-safe view of an aggregate used by units of work, which track
/// aggregates of different types side by side.
pub trait EventSourced: Send + Sync {
    /// Stream identifier.
    fn stream_id(&self) -> &str;

    /// Aggregate type name.
    fn aggregate_type(&self) -> &'static str;

    /// Version including pending events.
    fn current_version(&self) -> u64;

    /// Version as last persisted.
    fn persisted_version(&self) -> u64;

    /// Version of the snapshot the instance was seeded from.
    fn last_snapshot_version(&self) -> u64;

    /// Encodes and clears pending events.
    ///
    /// # Errors
    ///
    /// Returns `AggregateError::Serialization` on encoding failure.
    fn drain_pending(&mut self) -> Result<Vec<NewEvent>, AggregateError>;

    /// Captures a snapshot of the current state.
    ///
    /// # Errors
    ///
    /// Returns `SnapshotError::Serialization` on encoding failure.
    fn capture_snapshot(&self, clock: &dyn Clock) -> Result<Snapshot, SnapshotError>;
}

impl<S: AggregateState> EventSourced for Aggregate<S> {
    fn stream_id(&self) -> &str {
        &self.id
    }

    fn aggregate_type(&self) -> &'static str {
        S::AGGREGATE_TYPE
    }

    fn current_version(&self) -> u64 {
        self.version
    }

    fn persisted_version(&self) -> u64 {
        self.committed_version()
    }

    fn last_snapshot_version(&self) -> u64 {
        self.snapshot_version
    }

    fn drain_pending(&mut self) -> Result<Vec<NewEvent>, AggregateError> {
        self.take_new_events()
    }

    fn capture_snapshot(&self, clock: &dyn Clock) -> Result<Snapshot, SnapshotError> {
        self.to_snapshot(clock)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde::Deserialize;

    use super::*;
    use crate::event::{decode_tagged, encode_tagged};

    struct Fixed(DateTime<Utc>);

    impl Clock for Fixed {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn clock() -> Fixed {
        Fixed(Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap())
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    enum TallyEvent {
        #[serde(rename = "tally.added")]
        Added { amount: i64 },
        #[serde(rename = "tally.cleared")]
        Cleared,
    }

    impl DomainEvent for TallyEvent {
        const EVENT_TYPES: &'static [&'static str] = &["tally.added", "tally.cleared"];

        fn event_type(&self) -> &'static str {
            match self {
                Self::Added { .. } => "tally.added",
                Self::Cleared => "tally.cleared",
            }
        }

        fn to_payload(&self) -> Result<serde_json::Value, serde_json::Error> {
            encode_tagged(self)
        }

        fn from_payload(
            event_type: &str,
            payload: serde_json::Value,
        ) -> Result<Self, serde_json::Error> {
            decode_tagged(event_type, payload)
        }
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Tally {
        total: i64,
    }

    impl AggregateState for Tally {
        type Event = TallyEvent;
        const AGGREGATE_TYPE: &'static str = "Tally";

        fn transition(&mut self, event: &TallyEvent) {
            match event {
                TallyEvent::Added { amount } => self.total += amount,
                TallyEvent::Cleared => self.total = 0,
            }
        }
    }

    fn recorded(id: &str, seq: u64, event_type: &str, payload: serde_json::Value) -> RecordedEvent {
        NewEvent::new("Tally", event_type, payload, clock().0).record(id, seq)
    }

    #[test]
    fn test_apply_transitions_state_and_queues_event() {
        // Arrange
        let mut tally = Aggregate::<Tally>::new("t-1");

        // Act
        tally.apply(TallyEvent::Added { amount: 5 }, &clock());
        tally.apply(TallyEvent::Added { amount: 2 }, &clock());

        // Assert
        assert_eq!(tally.state().total, 7);
        assert_eq!(tally.version(), 2);
        assert_eq!(tally.committed_version(), 0);
        assert_eq!(tally.pending_events().len(), 2);
        assert_eq!(tally.created_at(), Some(clock().0));
    }

    #[test]
    fn test_collect_pending_returns_and_clears_queue() {
        let mut tally = Aggregate::<Tally>::new("t-1");
        tally.apply(TallyEvent::Cleared, &clock());

        let pending = tally.collect_pending();

        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event, TallyEvent::Cleared);
        assert!(tally.pending_events().is_empty());
        assert_eq!(tally.committed_version(), 1);
    }

    #[test]
    fn test_execute_applies_nothing_when_decision_fails() {
        let mut tally = Aggregate::<Tally>::new("t-1");

        let result: Result<usize, &str> = tally.execute(&clock(), |_| Err("rejected"));

        assert_eq!(result, Err("rejected"));
        assert_eq!(tally.version(), 0);
    }

    #[test]
    fn test_from_events_sorts_by_sequence_number() {
        // Arrange
        let events = vec![
            recorded("t-1", 2, "tally.added", serde_json::json!({ "amount": 3 })),
            recorded("t-1", 1, "tally.cleared", serde_json::Value::Null),
            recorded("t-1", 3, "tally.added", serde_json::json!({ "amount": 4 })),
        ];

        // Act
        let tally = Aggregate::<Tally>::from_events("t-1", &events).unwrap();

        // Assert
        assert_eq!(tally.state().total, 7);
        assert_eq!(tally.version(), 3);
        assert!(tally.pending_events().is_empty());
    }

    #[test]
    fn test_from_events_matches_in_memory_state_before_persist() {
        // Arrange
        let mut live = Aggregate::<Tally>::new("t-1");
        live.apply(TallyEvent::Added { amount: 10 }, &clock());
        live.apply(TallyEvent::Cleared, &clock());
        live.apply(TallyEvent::Added { amount: 1 }, &clock());
        let recorded: Vec<RecordedEvent> = live
            .clone()
            .take_new_events()
            .unwrap()
            .into_iter()
            .enumerate()
            .map(|(i, e)| e.record("t-1", i as u64 + 1))
            .collect();

        // Act
        let rebuilt = Aggregate::<Tally>::from_events("t-1", &recorded).unwrap();

        // Assert
        assert_eq!(rebuilt.state(), live.state());
        assert_eq!(rebuilt.version(), live.version());
    }

    #[test]
    fn test_from_events_fails_fast_on_unhandled_event() {
        let events = vec![
            recorded("t-1", 1, "tally.added", serde_json::json!({ "amount": 1 })),
            recorded("t-1", 2, "tally.exploded", serde_json::json!({})),
        ];

        let result = Aggregate::<Tally>::from_events("t-1", &events);

        match result {
            Err(AggregateError::UnhandledEvent { event_type, .. }) => {
                assert_eq!(event_type, "tally.exploded");
            }
            other => panic!("expected UnhandledEvent, got {other:?}"),
        }
    }

    #[test]
    fn test_from_events_rejects_gaps() {
        let events = vec![
            recorded("t-1", 1, "tally.cleared", serde_json::Value::Null),
            recorded("t-1", 3, "tally.cleared", serde_json::Value::Null),
        ];

        let result = Aggregate::<Tally>::from_events("t-1", &events);

        assert!(matches!(
            result,
            Err(AggregateError::SequenceGap {
                expected: 2,
                actual: 3,
                ..
            })
        ));
    }

    #[test]
    fn test_from_events_rejects_malformed_payload() {
        let events = vec![recorded(
            "t-1",
            1,
            "tally.added",
            serde_json::json!({ "amount": "many" }),
        )];

        let result = Aggregate::<Tally>::from_events("t-1", &events);

        assert!(matches!(result, Err(AggregateError::Deserialization { .. })));
    }

    #[test]
    fn test_replay_rejects_foreign_stream() {
        let mut tally = Aggregate::<Tally>::new("t-1");
        let result = tally.replay(&recorded("t-2", 1, "tally.cleared", serde_json::Value::Null));
        assert!(matches!(result, Err(AggregateError::StreamMismatch { .. })));
    }

    #[test]
    fn test_snapshot_plus_tail_equals_full_replay() {
        // Arrange
        let history = vec![
            recorded("t-1", 1, "tally.added", serde_json::json!({ "amount": 1 })),
            recorded("t-1", 2, "tally.added", serde_json::json!({ "amount": 2 })),
            recorded("t-1", 3, "tally.added", serde_json::json!({ "amount": 3 })),
            recorded("t-1", 4, "tally.added", serde_json::json!({ "amount": 4 })),
        ];
        let at_two = Aggregate::<Tally>::from_events("t-1", &history[..2]).unwrap();
        let snapshot = at_two.to_snapshot(&clock()).unwrap();

        // Act
        let mut seeded = Aggregate::<Tally>::from_snapshot(&snapshot).unwrap();
        seeded.replay_all(&history[2..]).unwrap();
        let full = Aggregate::<Tally>::from_events("t-1", &history).unwrap();

        // Assert
        assert_eq!(seeded.state(), full.state());
        assert_eq!(seeded.version(), full.version());
        assert_eq!(seeded.snapshot_version(), 2);
    }

    #[test]
    fn test_from_snapshot_rejects_other_aggregate_type() {
        let snapshot = Snapshot::capture("t-1", "Other", 1, &Tally { total: 1 }, clock().0).unwrap();
        assert!(matches!(
            Aggregate::<Tally>::from_snapshot(&snapshot),
            Err(AggregateError::Snapshot(_))
        ));
    }

    #[test]
    fn test_take_new_events_encodes_type_version_and_metadata() {
        let mut tally = Aggregate::<Tally>::new("t-1");
        tally.apply_with_metadata(
            TallyEvent::Added { amount: 9 },
            EventMetadata::new().with("source", "test"),
            &clock(),
        );

        let events = tally.take_new_events().unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].aggregate_type, "Tally");
        assert_eq!(events[0].event_type, "tally.added");
        assert_eq!(events[0].schema_version, 1);
        assert_eq!(events[0].payload, serde_json::json!({ "amount": 9 }));
        assert_eq!(events[0].metadata.get("source"), Some("test"));
        assert_eq!(tally.persisted_version(), 1);
    }
}
