//! Unit of work.
//!
//! A unit of work is the transaction boundary around one or more aggregate
//! mutations. Aggregates are tracked at the version they were loaded at;
//! their pending events are collected into the unit and written by a
//! single atomic `append_batch` at commit. Either every event is persisted
//! and forwarded to the publisher, or nothing is.
//!
//! ```text
//! Idle --begin--> Active(1) --begin--> Active(2) ...
//! Active(n>1) --commit/rollback--> Active(n-1)    (savepoint released / restored)
//! Active(1)   --commit--> Committed               (terminal)
//! Active(1)   --rollback or failed commit--> Idle
//! any         --dispose--> Disposed               (terminal)
//! ```
//!
//! Registering an aggregate drains its pending events into the unit. If the
//! unit is rolled back those events are gone and the aggregate instance is
//! stale: reload it before using it again.

use std::collections::HashMap;
use std::sync::Arc;

use eventide_core::aggregate::EventSourced;
use eventide_core::clock::SharedClock;
use eventide_core::error::EventStoreError;
use eventide_core::event::{NewEvent, RecordedEvent};
use eventide_core::snapshot::{Snapshot, SnapshotStore, SnapshotStrategy};
use eventide_core::store::{EventStore, ExpectedVersion, StreamAppend};

use crate::error::{StreamConflict, UnitOfWorkError};
use crate::publisher::EventPublisher;
use crate::repository::SnapshotPolicy;

/// Lifecycle state of a [`UnitOfWork`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    /// No transaction is open.
    Idle,
    /// A transaction is open; `depth` counts nested `begin` calls.
    Active {
        /// Nesting depth, at least 1.
        depth: usize,
    },
    /// The outermost transaction committed. Terminal.
    Committed,
    /// The unit was disposed. Terminal.
    Disposed,
}

impl std::fmt::Display for UnitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Active { depth } => write!(f, "active (depth {depth})"),
            Self::Committed => f.write_str("committed"),
            Self::Disposed => f.write_str("disposed"),
        }
    }
}

#[derive(Debug)]
struct Tracked {
    stream_id: String,
    aggregate_type: &'static str,
    entry_version: u64,
}

#[derive(Debug)]
struct Write {
    stream_id: String,
    events: Vec<NewEvent>,
    snapshot: Option<SnapshotCandidate>,
}

#[derive(Debug)]
struct SnapshotCandidate {
    snapshot: Snapshot,
    events_since_last: u64,
}

#[derive(Debug, Clone, Copy)]
struct Savepoint {
    tracked: usize,
    writes: usize,
}

/// Transactional boundary around aggregate mutations.
pub struct UnitOfWork {
    store: Arc<dyn EventStore>,
    clock: SharedClock,
    publisher: Option<Arc<dyn EventPublisher>>,
    snapshots: Option<SnapshotPolicy>,
    state: UnitState,
    tracked: Vec<Tracked>,
    writes: Vec<Write>,
    savepoints: Vec<Savepoint>,
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("state", &self.state)
            .field("tracked", &self.tracked)
            .field("pending_events", &self.pending_event_count())
            .field("publisher", &self.publisher.is_some())
            .field("snapshots", &self.snapshots.is_some())
            .finish_non_exhaustive()
    }
}

impl UnitOfWork {
    /// Creates an idle unit over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>, clock: SharedClock) -> Self {
        Self {
            store,
            clock,
            publisher: None,
            snapshots: None,
            state: UnitState::Idle,
            tracked: Vec::new(),
            writes: Vec::new(),
            savepoints: Vec::new(),
        }
    }

    /// Forwards committed events to `publisher`.
    #[must_use]
    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Offers snapshots of registered aggregates to `store` after commit.
    #[must_use]
    pub fn with_snapshots(
        mut self,
        store: Arc<dyn SnapshotStore>,
        strategy: Arc<dyn SnapshotStrategy>,
    ) -> Self {
        self.snapshots = Some(SnapshotPolicy { store, strategy });
        self
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> UnitState {
        self.state
    }

    /// Nesting depth; 0 unless active.
    #[must_use]
    pub fn depth(&self) -> usize {
        match self.state {
            UnitState::Active { depth } => depth,
            _ => 0,
        }
    }

    /// Number of events collected so far.
    #[must_use]
    pub fn pending_event_count(&self) -> usize {
        self.writes.iter().map(|w| w.events.len()).sum()
    }

    /// Opens the transaction, or a savepoint inside an open one.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` once the unit is committed or disposed.
    pub fn begin(&mut self) -> Result<(), UnitOfWorkError> {
        match self.state {
            UnitState::Idle => {
                self.state = UnitState::Active { depth: 1 };
                tracing::debug!("unit of work started");
            }
            UnitState::Active { depth } => {
                self.savepoints.push(Savepoint {
                    tracked: self.tracked.len(),
                    writes: self.writes.len(),
                });
                self.state = UnitState::Active { depth: depth + 1 };
                tracing::debug!(depth = depth + 1, "savepoint created");
            }
            state => {
                return Err(UnitOfWorkError::InvalidState {
                    operation: "begin",
                    state,
                });
            }
        }
        Ok(())
    }

    /// Records the aggregate's persisted version as the version the
    /// commit expects. Tracking the same stream again has no effect.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless a transaction is open.
    pub fn track(&mut self, aggregate: &dyn EventSourced) -> Result<(), UnitOfWorkError> {
        self.require_active("track")?;
        self.track_stream(aggregate);
        Ok(())
    }

    /// Tracks the aggregate if needed and moves its pending events into
    /// the unit. Returns how many events were collected.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless a transaction is open,
    /// `Concurrency` if this instance does not continue the events already
    /// collected for its stream, and `Aggregate` if an event cannot be
    /// encoded.
    pub fn register(&mut self, aggregate: &mut dyn EventSourced) -> Result<usize, UnitOfWorkError> {
        self.require_active("register")?;
        self.track_stream(aggregate);

        let stream_id = aggregate.stream_id().to_owned();
        let expected = self.next_expected(&stream_id);
        let actual = aggregate.persisted_version();
        if actual != expected {
            return Err(UnitOfWorkError::Concurrency {
                conflicts: vec![StreamConflict {
                    stream_id,
                    expected,
                    actual,
                }],
            });
        }

        let snapshot = self.snapshot_candidate(aggregate);
        let events = aggregate.drain_pending()?;
        let collected = events.len();
        if collected > 0 {
            self.writes.push(Write {
                stream_id,
                events,
                snapshot,
            });
        }
        Ok(collected)
    }

    /// Commits the innermost level. Nested levels release their savepoint;
    /// the outermost level checks every tracked stream, appends all
    /// collected events atomically, forwards them to the publisher and
    /// offers snapshots. Returns the events persisted by this call.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless a transaction is open. On
    /// `Concurrency` or `Store` errors the whole unit is rolled back and
    /// nothing is persisted.
    pub async fn commit(&mut self) -> Result<Vec<RecordedEvent>, UnitOfWorkError> {
        let depth = self.require_active("commit")?;
        if depth > 1 {
            self.savepoints.pop();
            self.state = UnitState::Active { depth: depth - 1 };
            tracing::debug!(depth = depth - 1, "savepoint released");
            return Ok(Vec::new());
        }

        if let Err(err) = self.verify_versions().await {
            self.reset(UnitState::Idle);
            return Err(err);
        }

        let batch = self.batch();
        let recorded = if batch.is_empty() {
            Vec::new()
        } else {
            match self.store.append_batch(&batch).await {
                Ok(recorded) => recorded,
                Err(err) => {
                    self.reset(UnitState::Idle);
                    return Err(match err {
                        EventStoreError::VersionConflict {
                            stream_id,
                            expected,
                            actual,
                        } => UnitOfWorkError::Concurrency {
                            conflicts: vec![StreamConflict {
                                stream_id,
                                expected,
                                actual,
                            }],
                        },
                        other => UnitOfWorkError::Store(other),
                    });
                }
            }
        };

        tracing::info!(
            streams = self.tracked.len(),
            events = recorded.len(),
            "unit of work committed"
        );
        let writes = std::mem::take(&mut self.writes);
        self.reset(UnitState::Committed);

        if let Some(publisher) = &self.publisher {
            if !recorded.is_empty() {
                publisher.forward(&recorded).await;
            }
        }
        if let Some(policy) = &self.snapshots {
            for candidate in writes.into_iter().filter_map(|w| w.snapshot) {
                policy.offer(candidate.snapshot, candidate.events_since_last).await;
            }
        }
        Ok(recorded)
    }

    /// Rolls back the innermost level: to the enclosing savepoint when
    /// nested, otherwise discards everything and returns to idle.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless a transaction is open.
    pub fn rollback(&mut self) -> Result<(), UnitOfWorkError> {
        let depth = self.require_active("rollback")?;
        match self.savepoints.pop() {
            Some(savepoint) if depth > 1 => {
                self.tracked.truncate(savepoint.tracked);
                self.writes.truncate(savepoint.writes);
                self.state = UnitState::Active { depth: depth - 1 };
                tracing::debug!(depth = depth - 1, "rolled back to savepoint");
            }
            _ => {
                let discarded = self.pending_event_count();
                self.reset(UnitState::Idle);
                tracing::debug!(discarded, "unit of work rolled back");
            }
        }
        Ok(())
    }

    /// Discards any open transaction and retires the unit.
    pub fn dispose(&mut self) {
        if matches!(self.state, UnitState::Active { .. }) && self.pending_event_count() > 0 {
            tracing::warn!(
                discarded = self.pending_event_count(),
                "unit of work disposed with uncommitted events"
            );
        }
        self.reset(UnitState::Disposed);
    }

    fn require_active(&self, operation: &'static str) -> Result<usize, UnitOfWorkError> {
        match self.state {
            UnitState::Active { depth } => Ok(depth),
            state => Err(UnitOfWorkError::InvalidState { operation, state }),
        }
    }

    fn reset(&mut self, state: UnitState) {
        self.tracked.clear();
        self.writes.clear();
        self.savepoints.clear();
        self.state = state;
    }

    fn track_stream(&mut self, aggregate: &dyn EventSourced) {
        if self.tracked.iter().any(|t| t.stream_id == aggregate.stream_id()) {
            return;
        }
        self.tracked.push(Tracked {
            stream_id: aggregate.stream_id().to_owned(),
            aggregate_type: aggregate.aggregate_type(),
            entry_version: aggregate.persisted_version(),
        });
    }

    /// Version the stream will be at once the events collected so far are
    /// appended.
    fn next_expected(&self, stream_id: &str) -> u64 {
        let entry = self
            .tracked
            .iter()
            .find(|t| t.stream_id == stream_id)
            .map_or(0, |t| t.entry_version);
        let queued: usize = self
            .writes
            .iter()
            .filter(|w| w.stream_id == stream_id)
            .map(|w| w.events.len())
            .sum();
        entry + queued as u64
    }

    fn snapshot_candidate(&self, aggregate: &dyn EventSourced) -> Option<SnapshotCandidate> {
        self.snapshots.as_ref()?;
        let events_since_last = aggregate.current_version() - aggregate.last_snapshot_version();
        match aggregate.capture_snapshot(self.clock.as_ref()) {
            Ok(snapshot) => Some(SnapshotCandidate {
                snapshot,
                events_since_last,
            }),
            Err(e) => {
                tracing::warn!(
                    aggregate_id = %aggregate.stream_id(),
                    aggregate_type = aggregate.aggregate_type(),
                    error = %e,
                    "failed to capture snapshot"
                );
                None
            }
        }
    }

    async fn verify_versions(&self) -> Result<(), UnitOfWorkError> {
        let mut conflicts = Vec::new();
        for tracked in &self.tracked {
            let actual = self.store.stream_version(&tracked.stream_id).await?;
            if actual != tracked.entry_version {
                tracing::warn!(
                    stream_id = %tracked.stream_id,
                    aggregate_type = tracked.aggregate_type,
                    expected = tracked.entry_version,
                    actual,
                    "tracked stream moved"
                );
                conflicts.push(StreamConflict {
                    stream_id: tracked.stream_id.clone(),
                    expected: tracked.entry_version,
                    actual,
                });
            }
        }
        if conflicts.is_empty() {
            Ok(())
        } else {
            Err(UnitOfWorkError::Concurrency { conflicts })
        }
    }

    /// One stream append per stream, events in registration order.
    fn batch(&self) -> Vec<StreamAppend> {
        let mut order: Vec<&str> = Vec::new();
        let mut events: HashMap<&str, Vec<NewEvent>> = HashMap::new();
        for write in &self.writes {
            let slot = events.entry(write.stream_id.as_str()).or_insert_with(|| {
                order.push(write.stream_id.as_str());
                Vec::new()
            });
            slot.extend(write.events.iter().cloned());
        }
        order
            .into_iter()
            .filter_map(|stream_id| {
                let entry_version = self
                    .tracked
                    .iter()
                    .find(|t| t.stream_id == stream_id)?
                    .entry_version;
                let events = events.remove(stream_id)?;
                Some(StreamAppend::new(stream_id, ExpectedVersion::Exact(entry_version), events))
            })
            .collect()
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        if matches!(self.state, UnitState::Active { .. }) && !self.writes.is_empty() {
            tracing::warn!(
                discarded = self.pending_event_count(),
                "unit of work dropped with uncommitted events"
            );
        }
    }
}
