use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use eventide_core::aggregate::Aggregate;
use eventide_core::clock::SharedClock;
use eventide_core::event::RecordedEvent;
use eventide_dispatch::{EventMatcher, FnHandler, HandlerError, RetryPolicy};
use eventide_engine::{Backend, EngineConfig, EngineContext};
use eventide_test_support::{Counter, CounterEvent, FixedClock};

fn clock() -> SharedClock {
    Arc::new(FixedClock::default_instant())
}

fn config() -> EngineConfig {
    EngineConfig::default()
        .with_retry(RetryPolicy::no_retry())
        .with_snapshot_every(2)
}

fn increment(counter: &mut Aggregate<Counter>, by: i64) {
    counter.apply(CounterEvent::Incremented { by }, &FixedClock::default_instant());
}

#[tokio::test]
async fn test_failed_projection_is_dead_lettered_and_replayed() {
    // Arrange
    let context = EngineContext::build(config(), clock()).await.unwrap();
    let healthy = Arc::new(AtomicBool::new(false));
    let projected = Arc::new(std::sync::Mutex::new(Vec::new()));
    {
        let healthy = Arc::clone(&healthy);
        let projected = Arc::clone(&projected);
        context.dispatcher().subscribe(
            EventMatcher::namespace("counter"),
            Arc::new(FnHandler::new("totals", move |event: RecordedEvent| {
                let healthy = Arc::clone(&healthy);
                let projected = Arc::clone(&projected);
                async move {
                    if !healthy.load(Ordering::SeqCst) {
                        return Err(HandlerError::Failed("projection db offline".into()));
                    }
                    projected.lock().unwrap().push(event.sequence_number);
                    Ok(())
                }
            })),
        );
    }
    let mut counter = Aggregate::<Counter>::new("c-1");
    increment(&mut counter, 3);
    let mut uow = context.unit_of_work();

    // Act
    uow.begin().unwrap();
    uow.register(&mut counter).unwrap();
    let committed = uow.commit().await.unwrap();

    // Assert
    assert_eq!(committed.len(), 1);
    assert_eq!(context.dead_letters().len().await.unwrap(), 1);

    let admin = context.dead_letter_admin();
    let listing = admin.list(None).await;
    assert!(listing.is_success());
    assert_eq!(listing.lines.len(), 1);

    healthy.store(true, Ordering::SeqCst);
    let replay = admin.replay(false).await;
    assert!(replay.is_success());
    assert!(context.dead_letters().is_empty().await.unwrap());
    assert_eq!(*projected.lock().unwrap(), vec![1]);
}

#[tokio::test]
async fn test_repository_snapshots_and_reloads_through_context() {
    // Arrange
    let context = EngineContext::build(config(), clock()).await.unwrap();
    let repository = context.repository::<Counter>();
    let mut counter = repository.load("c-1").await.unwrap();
    increment(&mut counter, 2);
    increment(&mut counter, 5);

    // Act
    repository.save(&mut counter).await.unwrap();
    let reloaded = repository.get("c-1").await.unwrap();

    // Assert
    let snapshot = context
        .snapshots()
        .get_snapshot("c-1", "Counter")
        .await
        .unwrap()
        .expect("snapshot after two events");
    assert_eq!(snapshot.version, 2);
    assert_eq!(reloaded.version(), 2);
    assert_eq!(reloaded.state().total, 7);
}

#[tokio::test]
async fn test_file_backend_survives_restart() {
    // Arrange
    let dir = tempfile::tempdir().unwrap();
    let file_config = || config().with_backend(Backend::File).with_data_dir(dir.path());
    {
        let context = EngineContext::build(file_config(), clock()).await.unwrap();
        let repository = context.repository::<Counter>();
        let mut counter = Aggregate::<Counter>::new("c-1");
        increment(&mut counter, 4);
        repository.save(&mut counter).await.unwrap();
        context.shutdown().await;
    }

    // Act
    let context = EngineContext::build(file_config(), clock()).await.unwrap();
    let counter = context.repository::<Counter>().get("c-1").await.unwrap();

    // Assert
    assert_eq!(counter.version(), 1);
    assert_eq!(counter.state().total, 4);
    assert!(dir.path().join("events.jsonl").exists());
}

#[tokio::test]
async fn test_conflicting_units_leave_store_unchanged() {
    // Arrange
    let context = EngineContext::build(config(), clock()).await.unwrap();
    let repository = context.repository::<Counter>();
    let mut seed = Aggregate::<Counter>::new("c-1");
    increment(&mut seed, 1);
    repository.save(&mut seed).await.unwrap();

    let mut first = repository.get("c-1").await.unwrap();
    let mut second = repository.get("c-1").await.unwrap();
    increment(&mut first, 1);
    increment(&mut second, 1);

    let mut winner = context.unit_of_work();
    winner.begin().unwrap();
    winner.register(&mut first).unwrap();
    winner.commit().await.unwrap();

    // Act
    let mut loser = context.unit_of_work();
    loser.begin().unwrap();
    loser.register(&mut second).unwrap();
    let result = loser.commit().await;

    // Assert
    assert!(result.unwrap_err().is_conflict());
    assert_eq!(context.store().stream_version("c-1").await.unwrap(), 2);
}
