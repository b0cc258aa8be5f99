//! Eventide event store backends.
//!
//! Every backend implements [`eventide_core::store::EventStore`] with the
//! same semantics: conflict-checked, all-or-nothing appends and ordered
//! reads. The matching snapshot stores implement
//! [`eventide_core::snapshot::SnapshotStore`].
//!
//! - [`in_memory`]: embedded, process-local; the reference backend.
//! - [`file_event_store`] / [`file_snapshot_store`]: embedded, durable
//!   JSON-lines log on local disk.
//! - [`pg_event_store`] / [`pg_snapshot_store`]: PostgreSQL via `sqlx`.

pub mod file_event_store;
pub mod file_snapshot_store;
pub mod in_memory;
pub mod pg_event_store;
pub mod pg_snapshot_store;
pub mod schema;

pub use file_event_store::FileEventStore;
pub use file_snapshot_store::FileSnapshotStore;
pub use in_memory::{InMemoryEventStore, InMemorySnapshotStore};
pub use pg_event_store::PgEventStore;
pub use pg_snapshot_store::PgSnapshotStore;
