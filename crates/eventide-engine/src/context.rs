//! The wired engine.

use std::sync::Arc;

use eventide_core::aggregate::AggregateState;
use eventide_core::clock::SharedClock;
use eventide_core::snapshot::{
    CompositeStrategy, CountStrategy, SnapshotStore, SnapshotStrategy, TimeStrategy,
};
use eventide_core::store::EventStore;
use eventide_core::upcast::UpcasterChain;
use eventide_dispatch::{
    DeadLetterAdmin, DeadLetterQueue, DeadLetterStore, Dispatcher, FileDeadLetterStore,
    InMemoryDeadLetterStore,
};
use eventide_event_store::{
    FileEventStore, FileSnapshotStore, InMemoryEventStore, InMemorySnapshotStore, PgEventStore,
    PgSnapshotStore,
};
use eventide_runtime::{AggregateRepository, UnitOfWork};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::{Backend, EngineConfig};
use crate::error::{ConfigError, EngineError};

const EVENT_LOG_FILE: &str = "events.jsonl";
const SNAPSHOT_DIR: &str = "snapshots";
const DEAD_LETTER_FILE: &str = "dead_letters.json";

struct Stores {
    events: Arc<dyn EventStore>,
    snapshots: Arc<dyn SnapshotStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    pool: Option<PgPool>,
}

/// Every engine collaborator, built once and shared.
///
/// Repositories and units of work handed out by the context all write to
/// the same store and forward committed events to the same dispatcher.
#[derive(Clone)]
pub struct EngineContext {
    config: EngineConfig,
    clock: SharedClock,
    store: Arc<dyn EventStore>,
    snapshots: Arc<dyn SnapshotStore>,
    strategy: Arc<dyn SnapshotStrategy>,
    dead_letters: Arc<DeadLetterQueue>,
    dispatcher: Arc<Dispatcher>,
    upcasters: Arc<UpcasterChain>,
    pool: Option<PgPool>,
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("backend", &self.config.backend)
            .field("dispatcher", &self.dispatcher)
            .field("upcasters", &self.upcasters)
            .finish_non_exhaustive()
    }
}

impl EngineContext {
    /// Opens the configured backend and wires the engine around it.
    ///
    /// # Errors
    ///
    /// Returns `EngineError` if a store cannot be opened, the database is
    /// unreachable, or migrations fail.
    pub async fn build(config: EngineConfig, clock: SharedClock) -> Result<Self, EngineError> {
        tracing::info!(backend = ?config.backend, data_dir = %config.data_dir.display(), "building engine");

        let stores = match config.backend {
            Backend::Memory => Stores {
                events: Arc::new(InMemoryEventStore::new()),
                snapshots: Arc::new(InMemorySnapshotStore::new()),
                dead_letters: Arc::new(InMemoryDeadLetterStore::new()),
                pool: None,
            },
            Backend::File => Stores {
                events: Arc::new(FileEventStore::open(config.data_dir.join(EVENT_LOG_FILE)).await?),
                snapshots: Arc::new(FileSnapshotStore::open(config.data_dir.join(SNAPSHOT_DIR)).await?),
                dead_letters: Arc::new(
                    FileDeadLetterStore::open(config.data_dir.join(DEAD_LETTER_FILE)).await?,
                ),
                pool: None,
            },
            Backend::Postgres => {
                let url = config
                    .database_url
                    .as_deref()
                    .ok_or(ConfigError::Missing("DATABASE_URL"))?;
                let pool = PgPoolOptions::new()
                    .max_connections(config.db_max_connections)
                    .connect(url)
                    .await?;
                tracing::info!("connected to database");
                eventide_event_store::schema::migrate(&pool).await?;
                tracing::info!("migrations applied");
                // Dead letters stay on local disk.
                Stores {
                    events: Arc::new(PgEventStore::new(pool.clone())),
                    snapshots: Arc::new(PgSnapshotStore::new(pool.clone())),
                    dead_letters: Arc::new(
                        FileDeadLetterStore::open(config.data_dir.join(DEAD_LETTER_FILE)).await?,
                    ),
                    pool: Some(pool),
                }
            }
        };

        let mut context = Self::from_parts(
            config,
            clock,
            stores.events,
            stores.snapshots,
            stores.dead_letters,
        );
        context.pool = stores.pool;
        Ok(context)
    }

    /// Wires the engine around stores built by the caller.
    #[must_use]
    pub fn from_parts(
        config: EngineConfig,
        clock: SharedClock,
        store: Arc<dyn EventStore>,
        snapshots: Arc<dyn SnapshotStore>,
        dead_letter_store: Arc<dyn DeadLetterStore>,
    ) -> Self {
        let strategy = snapshot_strategy(&config, &clock);
        let dead_letters = Arc::new(
            DeadLetterQueue::new(dead_letter_store, Arc::clone(&clock))
                .with_max_replay_attempts(config.dlq_max_replay_attempts),
        );
        let dispatcher = Arc::new(
            Dispatcher::builder()
                .retry_policy(config.retry)
                .circuit_breaker(config.circuit)
                .dead_letters(Arc::clone(&dead_letters))
                .build(),
        );

        Self {
            config,
            clock,
            store,
            snapshots,
            strategy,
            dead_letters,
            dispatcher,
            upcasters: Arc::new(UpcasterChain::new()),
            pool: None,
        }
    }

    /// Upcasts every event loaded through this context's repositories.
    #[must_use]
    pub fn with_upcasters(mut self, upcasters: UpcasterChain) -> Self {
        self.upcasters = Arc::new(upcasters);
        self
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Shared clock.
    #[must_use]
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// The event store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// The snapshot store.
    #[must_use]
    pub fn snapshots(&self) -> &Arc<dyn SnapshotStore> {
        &self.snapshots
    }

    /// The dispatcher that receives committed events.
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// The dead-letter queue fed by the dispatcher.
    #[must_use]
    pub fn dead_letters(&self) -> &Arc<DeadLetterQueue> {
        &self.dead_letters
    }

    /// The database pool, for the postgres backend.
    #[must_use]
    pub fn pool(&self) -> Option<&PgPool> {
        self.pool.as_ref()
    }

    /// A repository for aggregates of type `S`, with snapshots, upcasting
    /// and dispatch.
    #[must_use]
    pub fn repository<S: AggregateState>(&self) -> AggregateRepository<S> {
        AggregateRepository::new(Arc::clone(&self.store), Arc::clone(&self.clock))
            .with_snapshots(Arc::clone(&self.snapshots), Arc::clone(&self.strategy))
            .with_upcasters(Arc::clone(&self.upcasters))
            .with_publisher(self.dispatcher.clone())
    }

    /// A fresh unit of work that snapshots and dispatches on commit.
    #[must_use]
    pub fn unit_of_work(&self) -> UnitOfWork {
        UnitOfWork::new(Arc::clone(&self.store), Arc::clone(&self.clock))
            .with_snapshots(Arc::clone(&self.snapshots), Arc::clone(&self.strategy))
            .with_publisher(self.dispatcher.clone())
    }

    /// Admin commands over the dead-letter queue, replaying through the
    /// dispatcher.
    #[must_use]
    pub fn dead_letter_admin(&self) -> DeadLetterAdmin {
        DeadLetterAdmin::new(Arc::clone(&self.dead_letters), self.dispatcher.clone())
            .with_replay_defaults(self.config.replay_options())
    }

    /// Stops the dispatcher's listeners and closes the database pool.
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown();
        if let Some(pool) = &self.pool {
            pool.close().await;
        }
        tracing::info!("engine stopped");
    }
}

fn snapshot_strategy(config: &EngineConfig, clock: &SharedClock) -> Arc<dyn SnapshotStrategy> {
    let mut strategy = CompositeStrategy::new();
    if config.snapshot_every > 0 {
        strategy = strategy.with(CountStrategy::new(config.snapshot_every));
    }
    if let Some(interval) = config.snapshot_interval {
        strategy = strategy.with(TimeStrategy::new(interval, Arc::clone(clock)));
    }
    Arc::new(strategy)
}
