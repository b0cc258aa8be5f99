//! Aggregate repository.
//!
//! Loading starts from the latest usable snapshot, if any, and replays the
//! events recorded after it. Every event passes through the upcaster chain
//! before it reaches the aggregate. Snapshot problems never fail a load or
//! a save: the repository logs them and falls back to full replay.

use std::marker::PhantomData;
use std::sync::Arc;

use eventide_core::aggregate::{Aggregate, AggregateState};
use eventide_core::clock::SharedClock;
use eventide_core::error::DomainError;
use eventide_core::event::RecordedEvent;
use eventide_core::snapshot::{Snapshot, SnapshotStore, SnapshotStrategy};
use eventide_core::store::{EventStore, ExpectedVersion};
use eventide_core::upcast::UpcasterChain;

use crate::publisher::EventPublisher;

/// Snapshot store and the strategy deciding when to write to it.
#[derive(Clone)]
pub(crate) struct SnapshotPolicy {
    pub(crate) store: Arc<dyn SnapshotStore>,
    pub(crate) strategy: Arc<dyn SnapshotStrategy>,
}

impl SnapshotPolicy {
    /// Stores `snapshot` if the strategy says the aggregate is due.
    /// Returns `true` if a snapshot was written.
    pub(crate) async fn offer(&self, snapshot: Snapshot, events_since_last: u64) -> bool {
        if !self.strategy.should_snapshot(&snapshot.aggregate_id, events_since_last) {
            return false;
        }
        match self.store.save_snapshot(&snapshot).await {
            Ok(()) => {
                self.strategy.snapshot_taken(&snapshot.aggregate_id);
                tracing::debug!(
                    aggregate_id = %snapshot.aggregate_id,
                    version = snapshot.version,
                    "snapshot saved"
                );
                true
            }
            Err(e) => {
                tracing::warn!(
                    aggregate_id = %snapshot.aggregate_id,
                    version = snapshot.version,
                    error = %e,
                    "failed to save snapshot"
                );
                false
            }
        }
    }
}

/// Loads and saves aggregates of one type.
pub struct AggregateRepository<S: AggregateState> {
    store: Arc<dyn EventStore>,
    snapshots: Option<SnapshotPolicy>,
    upcasters: Arc<UpcasterChain>,
    publisher: Option<Arc<dyn EventPublisher>>,
    clock: SharedClock,
    _state: PhantomData<fn() -> S>,
}

impl<S: AggregateState> Clone for AggregateRepository<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            snapshots: self.snapshots.clone(),
            upcasters: Arc::clone(&self.upcasters),
            publisher: self.publisher.clone(),
            clock: Arc::clone(&self.clock),
            _state: PhantomData,
        }
    }
}

impl<S: AggregateState> std::fmt::Debug for AggregateRepository<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateRepository")
            .field("aggregate_type", &S::AGGREGATE_TYPE)
            .field("snapshots", &self.snapshots.is_some())
            .field("upcasters", &self.upcasters)
            .field("publisher", &self.publisher.is_some())
            .finish_non_exhaustive()
    }
}

impl<S: AggregateState> AggregateRepository<S> {
    /// Creates a repository without snapshots or upcasters.
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>, clock: SharedClock) -> Self {
        Self {
            store,
            snapshots: None,
            upcasters: Arc::new(UpcasterChain::new()),
            publisher: None,
            clock,
            _state: PhantomData,
        }
    }

    /// Reads and writes snapshots through `store`, writing when `strategy`
    /// says so.
    #[must_use]
    pub fn with_snapshots(
        mut self,
        store: Arc<dyn SnapshotStore>,
        strategy: Arc<dyn SnapshotStrategy>,
    ) -> Self {
        self.snapshots = Some(SnapshotPolicy { store, strategy });
        self
    }

    /// Upcasts every loaded event with `upcasters`.
    #[must_use]
    pub fn with_upcasters(mut self, upcasters: Arc<UpcasterChain>) -> Self {
        self.upcasters = upcasters;
        self
    }

    /// Forwards saved events to `publisher`.
    #[must_use]
    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Loads the current state of `id`. A stream with no events yields a
    /// fresh aggregate at version 0.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` on store failure, and
    /// `DomainError::Aggregate` or `DomainError::Upcast` if an event cannot
    /// be applied. Events are never skipped.
    pub async fn load(&self, id: &str) -> Result<Aggregate<S>, DomainError> {
        self.rebuild(id, None).await
    }

    /// Like [`AggregateRepository::load`] but fails with
    /// `DomainError::AggregateNotFound` for a stream with no events.
    ///
    /// # Errors
    ///
    /// See [`AggregateRepository::load`].
    pub async fn get(&self, id: &str) -> Result<Aggregate<S>, DomainError> {
        let aggregate = self.load(id).await?;
        if aggregate.version() == 0 {
            return Err(DomainError::AggregateNotFound(id.to_owned()));
        }
        Ok(aggregate)
    }

    /// Rebuilds `id` as of `version`: only events with sequence numbers up
    /// to `version` are applied, and only snapshots at or below it are used.
    ///
    /// # Errors
    ///
    /// See [`AggregateRepository::load`].
    pub async fn load_at(&self, id: &str, version: u64) -> Result<Aggregate<S>, DomainError> {
        if version == 0 {
            return Ok(Aggregate::new(id));
        }
        self.rebuild(id, Some(version)).await
    }

    /// Appends the aggregate's pending events, expecting the stream to be
    /// at the aggregate's committed version, then offers a snapshot and
    /// forwards the events. Pending events stay queued if the append fails.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ConcurrencyConflict` if the stream moved,
    /// `DomainError::Aggregate` if an event cannot be encoded, and
    /// `DomainError::Infrastructure` on store failure.
    pub async fn save(&self, aggregate: &mut Aggregate<S>) -> Result<Vec<RecordedEvent>, DomainError> {
        if aggregate.pending_events().is_empty() {
            return Ok(Vec::new());
        }
        let events = aggregate
            .pending_events()
            .iter()
            .map(|p| p.to_new_event(S::AGGREGATE_TYPE))
            .collect::<Result<Vec<_>, _>>()?;
        let expected = ExpectedVersion::Exact(aggregate.committed_version());
        let recorded = self.store.append(aggregate.id(), &events, expected).await?;
        aggregate.collect_pending();
        tracing::debug!(
            stream_id = %aggregate.id(),
            aggregate_type = S::AGGREGATE_TYPE,
            version = aggregate.version(),
            appended = recorded.len(),
            "aggregate saved"
        );

        self.offer_snapshot(aggregate).await;
        if let Some(publisher) = &self.publisher {
            publisher.forward(&recorded).await;
        }
        Ok(recorded)
    }

    async fn offer_snapshot(&self, aggregate: &mut Aggregate<S>) {
        let Some(policy) = &self.snapshots else {
            return;
        };
        let since_last = aggregate.version() - aggregate.snapshot_version();
        match aggregate.to_snapshot(self.clock.as_ref()) {
            Ok(snapshot) => {
                let version = snapshot.version;
                if policy.offer(snapshot, since_last).await {
                    aggregate.mark_snapshot(version);
                }
            }
            Err(e) => tracing::warn!(
                aggregate_id = %aggregate.id(),
                error = %e,
                "failed to capture snapshot"
            ),
        }
    }

    async fn rebuild(&self, id: &str, to_version: Option<u64>) -> Result<Aggregate<S>, DomainError> {
        let mut aggregate = match self.snapshot_base(id, to_version).await {
            Some(seeded) => seeded,
            None => Aggregate::new(id),
        };
        let from = aggregate.version() + 1;
        let events = self.store.get_events(id, from, to_version).await?;
        let replayed = events.len();
        for event in events {
            let event = self.upcasters.upcast_to_latest(event)?;
            aggregate.replay(&event)?;
        }
        tracing::debug!(
            stream_id = %id,
            aggregate_type = S::AGGREGATE_TYPE,
            snapshot_version = aggregate.snapshot_version(),
            replayed,
            version = aggregate.version(),
            "aggregate loaded"
        );
        Ok(aggregate)
    }

    async fn snapshot_base(&self, id: &str, to_version: Option<u64>) -> Option<Aggregate<S>> {
        let policy = self.snapshots.as_ref()?;
        let snapshot = match policy.store.get_snapshot(id, S::AGGREGATE_TYPE).await {
            Ok(found) => found?,
            Err(e) => {
                tracing::warn!(aggregate_id = %id, error = %e, "snapshot lookup failed, replaying from start");
                return None;
            }
        };
        if to_version.is_some_and(|v| snapshot.version > v) {
            return None;
        }
        match Aggregate::from_snapshot(&snapshot) {
            Ok(aggregate) => Some(aggregate),
            Err(e) => {
                tracing::warn!(
                    aggregate_id = %id,
                    version = snapshot.version,
                    error = %e,
                    "unusable snapshot, replaying from start"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use eventide_core::clock::Clock;
    use eventide_core::event::NewEvent;
    use eventide_core::snapshot::CountStrategy;
    use eventide_core::upcast::FnUpcaster;
    use eventide_event_store::{InMemoryEventStore, InMemorySnapshotStore};
    use eventide_test_support::{Counter, CounterEvent, FailingEventStore, FixedClock};

    use super::*;

    fn clock() -> SharedClock {
        Arc::new(FixedClock::default_instant())
    }

    fn repo(store: Arc<InMemoryEventStore>) -> AggregateRepository<Counter> {
        AggregateRepository::new(store, clock())
    }

    async fn counter_with(repo: &AggregateRepository<Counter>, id: &str, increments: &[i64]) -> Aggregate<Counter> {
        let mut counter = repo.load(id).await.unwrap();
        let clock = FixedClock::default_instant();
        for by in increments {
            counter.apply(CounterEvent::Incremented { by: *by }, &clock);
        }
        repo.save(&mut counter).await.unwrap();
        counter
    }

    #[tokio::test]
    async fn test_save_then_load_round_trips_state() {
        // Arrange
        let repo = repo(Arc::new(InMemoryEventStore::new()));
        let saved = counter_with(&repo, "c-1", &[2, 3, 5]).await;

        // Act
        let loaded = repo.load("c-1").await.unwrap();

        // Assert
        assert_eq!(loaded.version(), 3);
        assert_eq!(loaded.state(), saved.state());
        assert_eq!(loaded.state().total, 10);
        assert!(loaded.pending_events().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_stream_loads_fresh_but_get_fails() {
        let repo = repo(Arc::new(InMemoryEventStore::new()));

        let fresh = repo.load("nobody").await.unwrap();
        let missing = repo.get("nobody").await;

        assert_eq!(fresh.version(), 0);
        assert!(matches!(missing, Err(DomainError::AggregateNotFound(id)) if id == "nobody"));
    }

    #[tokio::test]
    async fn test_stale_save_conflicts_and_keeps_pending_events() {
        // Arrange
        let repo = repo(Arc::new(InMemoryEventStore::new()));
        counter_with(&repo, "c-1", &[1]).await;
        let mut first = repo.load("c-1").await.unwrap();
        let mut second = repo.load("c-1").await.unwrap();
        let clock = FixedClock::default_instant();
        first.apply(CounterEvent::Incremented { by: 1 }, &clock);
        second.apply(CounterEvent::Reset, &clock);
        repo.save(&mut first).await.unwrap();

        // Act
        let result = repo.save(&mut second).await;

        // Assert
        assert!(matches!(
            result,
            Err(DomainError::ConcurrencyConflict { expected: 1, actual: 2, .. })
        ));
        assert_eq!(second.pending_events().len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_plus_tail_matches_full_replay() {
        // Arrange
        let store = Arc::new(InMemoryEventStore::new());
        let snapshots = Arc::new(InMemorySnapshotStore::new());
        let with_snapshots = repo(Arc::clone(&store)).with_snapshots(snapshots.clone(), Arc::new(CountStrategy::new(3)));
        counter_with(&with_snapshots, "c-1", &[1, 2, 3]).await;
        counter_with(&with_snapshots, "c-1", &[4]).await;

        // Act
        let from_snapshot = with_snapshots.load("c-1").await.unwrap();
        let full = repo(store).load("c-1").await.unwrap();

        // Assert
        let snapshot = snapshots.get_snapshot("c-1", "Counter").await.unwrap().unwrap();
        assert_eq!(snapshot.version, 3);
        assert_eq!(from_snapshot.snapshot_version(), 3);
        assert_eq!(from_snapshot.version(), 4);
        assert_eq!(from_snapshot.state(), full.state());
    }

    #[tokio::test]
    async fn test_load_at_rebuilds_past_versions() {
        let store = Arc::new(InMemoryEventStore::new());
        let snapshots = Arc::new(InMemorySnapshotStore::new());
        let repo = repo(store).with_snapshots(snapshots, Arc::new(CountStrategy::new(4)));
        counter_with(&repo, "c-1", &[1, 10, 100, 1000, 10_000]).await;

        let at_two = repo.load_at("c-1", 2).await.unwrap();
        let at_five = repo.load_at("c-1", 5).await.unwrap();
        let at_zero = repo.load_at("c-1", 0).await.unwrap();

        assert_eq!(at_two.version(), 2);
        assert_eq!(at_two.state().total, 11);
        assert_eq!(at_five.state().total, 11_111);
        assert_eq!(at_zero.version(), 0);
    }

    #[tokio::test]
    async fn test_upcasters_run_before_replay() {
        // Arrange
        let old = NewEvent::new(
            "Counter",
            "counter.incremented",
            serde_json::json!({ "amount": 7 }),
            FixedClock::default_instant().now(),
        );
        let store = Arc::new(InMemoryEventStore::new());
        store
            .append("c-1", &[old], ExpectedVersion::NoStream)
            .await
            .unwrap();
        let upcasters = UpcasterChain::new().with(FnUpcaster::new("counter.incremented", 1, |p| {
            let by = p.get("amount").cloned().ok_or_else(|| "missing amount".to_owned())?;
            Ok(serde_json::json!({ "by": by }))
        }));
        let repo = repo(store).with_upcasters(Arc::new(upcasters));

        // Act
        let counter = repo.load("c-1").await.unwrap();

        // Assert
        assert_eq!(counter.state().total, 7);
    }

    #[tokio::test]
    async fn test_store_failure_surfaces_as_infrastructure_error() {
        let repo: AggregateRepository<Counter> = AggregateRepository::new(Arc::new(FailingEventStore), clock());

        let result = repo.load("c-1").await;

        assert!(matches!(result, Err(DomainError::Infrastructure(_))));
    }
}
