//! Behavioral checks every `EventStore` backend must pass.
//!
//! Each check takes a store, runs against fresh stream ids and event types,
//! and panics on the first violated expectation. Backend test suites call
//! them one per `#[tokio::test]` so failures are reported individually.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use eventide_core::error::EventStoreError;
use eventide_core::event::{EventMetadata, NewEvent};
use eventide_core::notify::Channel;
use eventide_core::store::{EventStore, ExpectedVersion, StreamAppend};
use uuid::Uuid;

fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 15, 10, minute, 0).unwrap()
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

fn event(aggregate_type: &str, event_type: &str, n: i64, minute: u32) -> NewEvent {
    NewEvent::new(aggregate_type, event_type, serde_json::json!({ "n": n }), at(minute))
}

/// Appended events get sequence numbers `v+1..=v+k` and read back intact.
///
/// # Panics
///
/// Panics if the store violates the expectation.
pub async fn appends_contiguous_sequence_numbers(store: &dyn EventStore) {
    let stream = unique("seq");
    let metadata = EventMetadata::new()
        .with_correlation_id(Uuid::new_v4())
        .with("tenant", "acme");
    let first = event("Counter", "counter.incremented", 1, 0).with_metadata(metadata.clone());

    let appended = store
        .append(&stream, &[first.clone(), event("Counter", "counter.incremented", 2, 1)], ExpectedVersion::NoStream)
        .await
        .unwrap();
    store
        .append(&stream, &[event("Counter", "counter.reset", 3, 2).with_schema_version(2)], ExpectedVersion::Exact(2))
        .await
        .unwrap();

    let events = store.get_events(&stream, 0, None).await.unwrap();
    let sequence: Vec<u64> = events.iter().map(|e| e.sequence_number).collect();
    assert_eq!(sequence, vec![1, 2, 3]);
    assert_eq!(appended, events[..2].to_vec());
    assert_eq!(events[0].event_id, first.event_id);
    assert_eq!(events[0].metadata, metadata);
    assert_eq!(events[0].occurred_on, at(0));
    assert_eq!(events[2].schema_version, 2);
    assert!(events.iter().all(|e| e.aggregate_id == stream));
    assert_eq!(store.stream_version(&stream).await.unwrap(), 3);
}

/// Three events into an empty stream, then a second writer that still
/// expects version 0 is rejected with `{expected: 0, actual: 3}` and the
/// stream is unchanged.
///
/// # Panics
///
/// Panics if the store violates the expectation.
pub async fn rejects_stale_expected_version(store: &dyn EventStore) {
    let stream = unique("conflict");
    let batch: Vec<NewEvent> = (1..=3)
        .map(|n| event("Counter", "counter.incremented", n, 0))
        .collect();
    store.append(&stream, &batch, ExpectedVersion::Exact(0)).await.unwrap();

    let result = store
        .append(&stream, &[event("Counter", "counter.incremented", 4, 1)], ExpectedVersion::Exact(0))
        .await;

    match result {
        Err(EventStoreError::VersionConflict {
            stream_id,
            expected,
            actual,
        }) => {
            assert_eq!(stream_id, stream);
            assert_eq!(expected, 0);
            assert_eq!(actual, 3);
        }
        other => panic!("expected VersionConflict, got {other:?}"),
    }
    assert_eq!(store.stream_version(&stream).await.unwrap(), 3);
    assert_eq!(store.get_events(&stream, 0, None).await.unwrap().len(), 3);
}

/// `ExpectedVersion::Any` appends without a check.
///
/// # Panics
///
/// Panics if the store violates the expectation.
pub async fn any_version_skips_check(store: &dyn EventStore) {
    let stream = unique("any");
    store
        .append(&stream, &[event("Counter", "counter.incremented", 1, 0)], ExpectedVersion::Any)
        .await
        .unwrap();
    let appended = store
        .append(&stream, &[event("Counter", "counter.incremented", 2, 0)], ExpectedVersion::Any)
        .await
        .unwrap();
    assert_eq!(appended[0].sequence_number, 2);
}

/// Unknown streams read as empty at version 0.
///
/// # Panics
///
/// Panics if the store violates the expectation.
pub async fn unknown_stream_is_empty(store: &dyn EventStore) {
    let stream = unique("missing");
    assert!(store.get_events(&stream, 0, None).await.unwrap().is_empty());
    assert_eq!(store.stream_version(&stream).await.unwrap(), 0);
}

/// Range reads are inclusive on both ends.
///
/// # Panics
///
/// Panics if the store violates the expectation.
pub async fn reads_inclusive_ranges(store: &dyn EventStore) {
    let stream = unique("range");
    let batch: Vec<NewEvent> = (1..=5)
        .map(|n| event("Counter", "counter.incremented", n, 0))
        .collect();
    store.append(&stream, &batch, ExpectedVersion::NoStream).await.unwrap();

    let middle = store.get_events(&stream, 2, Some(4)).await.unwrap();
    let tail = store.get_events(&stream, 4, None).await.unwrap();
    let past_end = store.get_events(&stream, 6, None).await.unwrap();

    let seq = |events: &[eventide_core::event::RecordedEvent]| -> Vec<u64> {
        events.iter().map(|e| e.sequence_number).collect()
    };
    assert_eq!(seq(&middle), vec![2, 3, 4]);
    assert_eq!(seq(&tail), vec![4, 5]);
    assert!(past_end.is_empty());
}

/// Type scans cross streams, keep append order and honor `since`.
///
/// # Panics
///
/// Panics if the store violates the expectation.
pub async fn scans_by_event_and_aggregate_type(store: &dyn EventStore) {
    let aggregate_type = unique("Ledger");
    let opened = unique("ledger.opened");
    let closed = unique("ledger.closed");
    let (a, b) = (unique("a"), unique("b"));
    store
        .append(&a, &[event(&aggregate_type, &opened, 1, 0)], ExpectedVersion::NoStream)
        .await
        .unwrap();
    store
        .append(&b, &[event(&aggregate_type, &opened, 2, 5)], ExpectedVersion::NoStream)
        .await
        .unwrap();
    store
        .append(&a, &[event(&aggregate_type, &closed, 3, 10)], ExpectedVersion::Exact(1))
        .await
        .unwrap();

    let by_type = store.get_events_by_type(&opened, None).await.unwrap();
    let recent = store.get_events_by_type(&opened, Some(at(5))).await.unwrap();
    let by_aggregate = store
        .get_events_by_aggregate_type(&aggregate_type, None)
        .await
        .unwrap();
    let recent_aggregate = store
        .get_events_by_aggregate_type(&aggregate_type, Some(at(1)))
        .await
        .unwrap();

    let streams: Vec<&str> = by_type.iter().map(|e| e.aggregate_id.as_str()).collect();
    assert_eq!(streams, vec![a.as_str(), b.as_str()]);
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].aggregate_id, b);
    assert_eq!(by_aggregate.len(), 3);
    assert_eq!(by_aggregate[2].event_type, closed);
    assert_eq!(recent_aggregate.len(), 2);
}

/// A batch with one conflicting stream writes nothing to any stream.
///
/// # Panics
///
/// Panics if the store violates the expectation.
pub async fn batch_append_is_all_or_nothing(store: &dyn EventStore) {
    let (a, b) = (unique("batch-a"), unique("batch-b"));
    store
        .append(&b, &[event("Counter", "counter.incremented", 1, 0)], ExpectedVersion::NoStream)
        .await
        .unwrap();

    let rejected = store
        .append_batch(&[
            StreamAppend::new(&a, ExpectedVersion::NoStream, vec![event("Counter", "counter.incremented", 2, 0)]),
            StreamAppend::new(&b, ExpectedVersion::NoStream, vec![event("Counter", "counter.incremented", 3, 0)]),
        ])
        .await;
    assert!(matches!(rejected, Err(EventStoreError::VersionConflict { .. })));
    assert_eq!(store.stream_version(&a).await.unwrap(), 0);
    assert_eq!(store.stream_version(&b).await.unwrap(), 1);

    let accepted = store
        .append_batch(&[
            StreamAppend::new(&a, ExpectedVersion::NoStream, vec![event("Counter", "counter.incremented", 2, 0)]),
            StreamAppend::new(&b, ExpectedVersion::Exact(1), vec![event("Counter", "counter.incremented", 3, 0)]),
        ])
        .await
        .unwrap();
    assert_eq!(accepted.len(), 2);
    assert_eq!(store.stream_version(&a).await.unwrap(), 1);
    assert_eq!(store.stream_version(&b).await.unwrap(), 2);
}

/// Successful appends are announced to matching subscribers.
///
/// # Panics
///
/// Panics if the store violates the expectation or publishes nothing
/// within a second.
pub async fn publishes_appends_to_subscribers(store: &dyn EventStore) {
    let aggregate_type = unique("Notified");
    let Some(mut subscription) = store.subscribe(Channel::AggregateType(aggregate_type.clone())) else {
        panic!("store does not publish notifications");
    };
    let stream = unique("notify");

    store
        .append(&stream, &[event(&aggregate_type, "notified.created", 1, 0)], ExpectedVersion::NoStream)
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(1), subscription.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.aggregate_id, stream);
    assert_eq!(received.sequence_number, 1);
}

/// Runs every check in sequence.
///
/// # Panics
///
/// Panics on the first failing check.
pub async fn run_all(store: &dyn EventStore) {
    appends_contiguous_sequence_numbers(store).await;
    rejects_stale_expected_version(store).await;
    any_version_skips_check(store).await;
    unknown_stream_is_empty(store).await;
    reads_inclusive_ranges(store).await;
    scans_by_event_and_aggregate_type(store).await;
    batch_append_is_all_or_nothing(store).await;
}
