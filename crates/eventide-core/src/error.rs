//! Domain error types.

use thiserror::Error;

/// Errors raised by event store backends.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// Optimistic concurrency conflict: the stream moved since it was read.
    #[error("version conflict on stream {stream_id}: expected version {expected}, found {actual}")]
    VersionConflict {
        /// The stream that had the conflict.
        stream_id: String,
        /// The version the caller expected.
        expected: u64,
        /// The version actually persisted.
        actual: u64,
    },

    /// The backend failed to persist an append.
    #[error("append failed: {0}")]
    Append(String),

    /// The backend failed to read events.
    #[error("get events failed: {0}")]
    Read(String),

    /// An event record could not be encoded or decoded.
    #[error("event serialization failed: {0}")]
    Serialization(String),

    /// Persisted data is damaged and cannot be repaired automatically.
    #[error("event log is corrupt: {0}")]
    Corrupt(String),
}

impl EventStoreError {
    /// Returns `true` for conflicts a caller may resolve by reloading and
    /// retrying.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

/// Errors raised while building or mutating an aggregate.
#[derive(Debug, Error)]
pub enum AggregateError {
    /// No state transition exists for the event type.
    #[error("unhandled event type {event_type} for aggregate {aggregate_type}")]
    UnhandledEvent {
        /// The aggregate type being rebuilt.
        aggregate_type: &'static str,
        /// The event discriminator that has no transition.
        event_type: String,
    },

    /// A recorded payload did not match its declared event type.
    #[error("failed to decode {event_type} payload: {reason}")]
    Deserialization {
        /// The event discriminator.
        event_type: String,
        /// Decoder message.
        reason: String,
    },

    /// A pending event could not be encoded for persistence.
    #[error("failed to encode {event_type} payload: {reason}")]
    Serialization {
        /// The event discriminator.
        event_type: String,
        /// Encoder message.
        reason: String,
    },

    /// Replay encountered a sequence number that does not follow the
    /// aggregate's version.
    #[error("sequence gap on aggregate {aggregate_id}: expected {expected}, found {actual}")]
    SequenceGap {
        /// The aggregate being rebuilt.
        aggregate_id: String,
        /// The sequence number that should have come next.
        expected: u64,
        /// The sequence number that was found.
        actual: u64,
    },

    /// Replay was handed an event from a different stream.
    #[error("event for stream {actual} replayed onto aggregate {expected}")]
    StreamMismatch {
        /// The aggregate identifier.
        expected: String,
        /// The stream the event belongs to.
        actual: String,
    },

    /// Replay was attempted while uncommitted events are queued.
    #[error("aggregate {0} has pending events; replay requires a clean aggregate")]
    PendingEvents(String),

    /// A snapshot could not be restored.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// Errors raised by snapshot stores and snapshot encoding.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The backing store failed.
    #[error("snapshot storage error: {0}")]
    Storage(String),

    /// State could not be encoded or decoded.
    #[error("snapshot serialization error: {0}")]
    Serialization(String),

    /// The stored digest does not match the stored data.
    #[error("snapshot integrity check failed for aggregate {0}")]
    Integrity(String),
}

/// Errors raised by the upcasting pipeline.
#[derive(Debug, Error)]
pub enum UpcastError {
    /// No upcaster is registered for an intermediate schema version.
    #[error("no upcaster registered for {event_type} v{from_version}")]
    MissingStep {
        /// The event discriminator.
        event_type: String,
        /// The schema version that could not be lifted.
        from_version: u32,
    },

    /// An upcaster rejected the payload.
    #[error("upcasting {event_type} v{from_version} failed: {reason}")]
    Failed {
        /// The event discriminator.
        event_type: String,
        /// The schema version being lifted.
        from_version: u32,
        /// Upcaster message.
        reason: String,
    },
}

/// Top-level domain error type.
#[derive(Debug, Error)]
pub enum DomainError {
    /// An aggregate was not found.
    #[error("aggregate not found: {0}")]
    AggregateNotFound(String),

    /// Optimistic concurrency conflict.
    #[error("concurrency conflict on aggregate {aggregate_id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        /// The aggregate that had the conflict.
        aggregate_id: String,
        /// The expected version.
        expected: u64,
        /// The actual version found.
        actual: u64,
    },

    /// A validation error in domain logic.
    #[error("validation error: {0}")]
    Validation(String),

    /// Aggregate reconstruction failed.
    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    /// Event schema migration failed.
    #[error(transparent)]
    Upcast(#[from] UpcastError),

    /// An infrastructure/persistence error.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}

impl From<EventStoreError> for DomainError {
    fn from(err: EventStoreError) -> Self {
        match err {
            EventStoreError::VersionConflict {
                stream_id,
                expected,
                actual,
            } => Self::ConcurrencyConflict {
                aggregate_id: stream_id,
                expected,
                actual,
            },
            other => Self::Infrastructure(other.to_string()),
        }
    }
}
