//! Integration tests for `PgEventStore` and `PgSnapshotStore`.
//!
//! These need a reachable PostgreSQL instance named by `DATABASE_URL`;
//! run them with `cargo test -- --ignored`.

use chrono::{TimeZone, Utc};
use eventide_core::snapshot::{Snapshot, SnapshotStore};
use eventide_event_store::{PgEventStore, PgSnapshotStore};
use eventide_test_support::conformance;
use sqlx::PgPool;

// --- event store ---

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_pg_passes_all_checks(pool: PgPool) {
    conformance::run_all(&PgEventStore::new(pool)).await;
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_pg_rejects_stale_expected_version(pool: PgPool) {
    conformance::rejects_stale_expected_version(&PgEventStore::new(pool)).await;
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_pg_batch_append_is_all_or_nothing(pool: PgPool) {
    conformance::batch_append_is_all_or_nothing(&PgEventStore::new(pool)).await;
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_pg_publishes_appends_to_subscribers(pool: PgPool) {
    conformance::publishes_appends_to_subscribers(&PgEventStore::new(pool)).await;
}

// --- snapshots ---

fn snapshot(version: u64) -> Snapshot {
    Snapshot::capture(
        "c-1",
        "Counter",
        version,
        &serde_json::json!({ "total": version, "ratio": 0.5 }),
        Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap(),
    )
    .unwrap()
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_pg_snapshot_keeps_latest_version(pool: PgPool) {
    // Arrange
    let store = PgSnapshotStore::new(pool);

    // Act
    store.save_snapshot(&snapshot(10)).await.unwrap();
    store.save_snapshot(&snapshot(4)).await.unwrap();

    // Assert
    let loaded = store.get_snapshot("c-1", "Counter").await.unwrap().unwrap();
    assert_eq!(loaded.version, 10);
    assert!(loaded.verify());
    assert!(store.get_snapshot("c-1", "Account").await.unwrap().is_none());
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_pg_snapshot_delete(pool: PgPool) {
    let store = PgSnapshotStore::new(pool);
    store.save_snapshot(&snapshot(1)).await.unwrap();

    store.delete_snapshot("c-1").await.unwrap();

    assert!(store.get_snapshot("c-1", "Counter").await.unwrap().is_none());
}
