//! Store contract checks against the embedded backends.

use eventide_event_store::{FileEventStore, InMemoryEventStore};
use eventide_test_support::conformance;
use tempfile::TempDir;

async fn file_store() -> (TempDir, FileEventStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = FileEventStore::open(dir.path().join("events.jsonl"))
        .await
        .unwrap();
    (dir, store)
}

// --- in-memory ---

#[tokio::test]
async fn test_in_memory_appends_contiguous_sequence_numbers() {
    conformance::appends_contiguous_sequence_numbers(&InMemoryEventStore::new()).await;
}

#[tokio::test]
async fn test_in_memory_rejects_stale_expected_version() {
    conformance::rejects_stale_expected_version(&InMemoryEventStore::new()).await;
}

#[tokio::test]
async fn test_in_memory_any_version_skips_check() {
    conformance::any_version_skips_check(&InMemoryEventStore::new()).await;
}

#[tokio::test]
async fn test_in_memory_unknown_stream_is_empty() {
    conformance::unknown_stream_is_empty(&InMemoryEventStore::new()).await;
}

#[tokio::test]
async fn test_in_memory_reads_inclusive_ranges() {
    conformance::reads_inclusive_ranges(&InMemoryEventStore::new()).await;
}

#[tokio::test]
async fn test_in_memory_scans_by_event_and_aggregate_type() {
    conformance::scans_by_event_and_aggregate_type(&InMemoryEventStore::new()).await;
}

#[tokio::test]
async fn test_in_memory_batch_append_is_all_or_nothing() {
    conformance::batch_append_is_all_or_nothing(&InMemoryEventStore::new()).await;
}

#[tokio::test]
async fn test_in_memory_publishes_appends_to_subscribers() {
    conformance::publishes_appends_to_subscribers(&InMemoryEventStore::new()).await;
}

// --- file ---

#[tokio::test]
async fn test_file_store_passes_all_checks() {
    let (_dir, store) = file_store().await;
    conformance::run_all(&store).await;
}

#[tokio::test]
async fn test_file_store_passes_all_checks_after_reopen() {
    // Arrange
    let (dir, store) = file_store().await;
    conformance::run_all(&store).await;
    drop(store);

    // Act
    let reopened = FileEventStore::open(dir.path().join("events.jsonl"))
        .await
        .unwrap();

    // Assert
    conformance::run_all(&reopened).await;
}

#[tokio::test]
async fn test_file_store_publishes_appends_to_subscribers() {
    let (_dir, store) = file_store().await;
    conformance::publishes_appends_to_subscribers(&store).await;
}

// --- concurrency ---

#[tokio::test]
async fn test_concurrent_writers_exactly_one_wins() {
    use std::sync::Arc;

    use eventide_core::error::EventStoreError;
    use eventide_core::event::NewEvent;
    use eventide_core::store::{EventStore, ExpectedVersion};

    // Arrange
    let store = Arc::new(InMemoryEventStore::new());
    let writers = (0..8).map(|n| {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            let event = NewEvent::new(
                "Counter",
                "counter.incremented",
                serde_json::json!({ "by": n }),
                chrono::Utc::now(),
            );
            store.append("race", &[event], ExpectedVersion::NoStream).await
        })
    });

    // Act
    let mut wins = 0;
    let mut conflicts = 0;
    for writer in writers.collect::<Vec<_>>() {
        match writer.await.unwrap() {
            Ok(_) => wins += 1,
            Err(EventStoreError::VersionConflict { .. }) => conflicts += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    // Assert
    assert_eq!(wins, 1);
    assert_eq!(conflicts, 7);
    assert_eq!(store.stream_version("race").await.unwrap(), 1);
}
