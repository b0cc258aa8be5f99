//! Snapshot records, the snapshot store contract and snapshot strategies.
//!
//! A snapshot at version `V` caches an aggregate's state after applying
//! events `1..=V`. It is only ever a base for replaying events with
//! sequence numbers greater than `V`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::canonical;
use crate::clock::SharedClock;
use crate::error::SnapshotError;

/// Persisted snapshot shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Aggregate this snapshot belongs to.
    pub aggregate_id: String,
    /// Aggregate type recorded at capture time.
    pub aggregate_type: String,
    /// Sequence number of the last event folded into `data`.
    pub version: u64,
    /// Capture timestamp.
    pub created_at: DateTime<Utc>,
    /// Canonically serialized aggregate state.
    pub data: serde_json::Value,
    /// Hex SHA-256 of `data`.
    pub checksum: String,
}

impl Snapshot {
    /// Captures `state` in canonical form.
    ///
    /// # Errors
    ///
    /// Returns `SnapshotError::Serialization` if the state cannot be encoded.
    pub fn capture<T: Serialize + ?Sized>(
        aggregate_id: impl Into<String>,
        aggregate_type: impl Into<String>,
        version: u64,
        state: &T,
        created_at: DateTime<Utc>,
    ) -> Result<Self, SnapshotError> {
        let data = canonical::to_canonical_value(state)
            .map_err(|e| SnapshotError::Serialization(e.to_string()))?;
        let checksum = canonical::digest(&data);
        Ok(Self {
            aggregate_id: aggregate_id.into(),
            aggregate_type: aggregate_type.into(),
            version,
            created_at,
            data,
            checksum,
        })
    }

    /// Returns `true` if `data` still matches `checksum`.
    #[must_use]
    pub fn verify(&self) -> bool {
        canonical::digest(&self.data) == self.checksum
    }

    /// Returns `true` if this snapshot may seed an aggregate of the given
    /// type: types match and the digest checks out.
    #[must_use]
    pub fn is_usable_for(&self, aggregate_type: &str) -> bool {
        self.aggregate_type == aggregate_type && self.verify()
    }

    /// Decodes the captured state.
    ///
    /// # Errors
    ///
    /// Returns `SnapshotError::Integrity` on digest mismatch and
    /// `SnapshotError::Serialization` if the data does not fit `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, SnapshotError> {
        if !self.verify() {
            return Err(SnapshotError::Integrity(self.aggregate_id.clone()));
        }
        serde_json::from_value(self.data.clone())
            .map_err(|e| SnapshotError::Serialization(e.to_string()))
    }
}

/// Storage for the latest snapshot of each aggregate.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Stores `snapshot`, replacing an older one for the same aggregate.
    /// A snapshot older than the stored one is ignored.
    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), SnapshotError>;

    /// Returns the latest snapshot for `aggregate_id`, or `None` if there is
    /// none or it was recorded for a different aggregate type or fails its
    /// integrity check.
    async fn get_snapshot(
        &self,
        aggregate_id: &str,
        aggregate_type: &str,
    ) -> Result<Option<Snapshot>, SnapshotError>;

    /// Removes the snapshot for `aggregate_id`, if any.
    async fn delete_snapshot(&self, aggregate_id: &str) -> Result<(), SnapshotError>;
}

/// Filters a raw stored snapshot down to a usable one, logging why a
/// candidate was discarded. Backends call this from `get_snapshot`.
#[must_use]
pub fn usable_snapshot(candidate: Option<Snapshot>, aggregate_type: &str) -> Option<Snapshot> {
    let snapshot = candidate?;
    if snapshot.aggregate_type != aggregate_type {
        tracing::debug!(
            aggregate_id = %snapshot.aggregate_id,
            stored_type = %snapshot.aggregate_type,
            requested_type = %aggregate_type,
            "ignoring snapshot recorded for a different aggregate type"
        );
        return None;
    }
    if !snapshot.verify() {
        tracing::warn!(
            aggregate_id = %snapshot.aggregate_id,
            version = snapshot.version,
            "ignoring snapshot that failed its integrity check"
        );
        return None;
    }
    Some(snapshot)
}

/// Decides when an aggregate is due for a new snapshot.
pub trait SnapshotStrategy: Send + Sync {
    /// Returns `true` if a snapshot should be taken now.
    fn should_snapshot(&self, aggregate_id: &str, events_since_last_snapshot: u64) -> bool;

    /// Notifies the strategy that a snapshot was stored.
    fn snapshot_taken(&self, _aggregate_id: &str) {}
}

/// Snapshots once `threshold` events have accumulated since the last one.
#[derive(Debug, Clone, Copy)]
pub struct CountStrategy {
    threshold: u64,
}

impl CountStrategy {
    /// Creates a count-based strategy. A threshold of zero never fires.
    #[must_use]
    pub fn new(threshold: u64) -> Self {
        Self { threshold }
    }
}

impl SnapshotStrategy for CountStrategy {
    fn should_snapshot(&self, _aggregate_id: &str, events_since_last_snapshot: u64) -> bool {
        self.threshold > 0 && events_since_last_snapshot >= self.threshold
    }
}

/// Snapshots once `interval` of wall-clock time has passed since the last
/// snapshot of the same aggregate. An aggregate this strategy has never seen
/// is due as soon as it has unsnapshotted events.
pub struct TimeStrategy {
    interval: Duration,
    clock: SharedClock,
    last_taken: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl TimeStrategy {
    /// Creates a time-based strategy.
    #[must_use]
    pub fn new(interval: Duration, clock: SharedClock) -> Self {
        Self {
            interval,
            clock,
            last_taken: Mutex::new(HashMap::new()),
        }
    }
}

impl std::fmt::Debug for TimeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeStrategy")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl SnapshotStrategy for TimeStrategy {
    fn should_snapshot(&self, aggregate_id: &str, events_since_last_snapshot: u64) -> bool {
        if events_since_last_snapshot == 0 {
            return false;
        }
        let Some(last) = self.last_taken.lock().get(aggregate_id).copied() else {
            return true;
        };
        let elapsed = self.clock.now().signed_duration_since(last);
        elapsed.to_std().is_ok_and(|e| e >= self.interval)
    }

    fn snapshot_taken(&self, aggregate_id: &str) {
        self.last_taken
            .lock()
            .insert(aggregate_id.to_owned(), self.clock.now());
    }
}

/// Logical OR of its members.
#[derive(Default)]
pub struct CompositeStrategy {
    strategies: Vec<Box<dyn SnapshotStrategy>>,
}

impl CompositeStrategy {
    /// Creates an empty composite, which never fires.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a member strategy.
    #[must_use]
    pub fn with(mut self, strategy: impl SnapshotStrategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    /// Number of member strategies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    /// Returns `true` if there are no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

impl SnapshotStrategy for CompositeStrategy {
    fn should_snapshot(&self, aggregate_id: &str, events_since_last_snapshot: u64) -> bool {
        self.strategies
            .iter()
            .any(|s| s.should_snapshot(aggregate_id, events_since_last_snapshot))
    }

    fn snapshot_taken(&self, aggregate_id: &str) {
        for strategy in &self.strategies {
            strategy.snapshot_taken(aggregate_id);
        }
    }
}
