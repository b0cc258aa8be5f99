//! Engine configuration read from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use eventide_dispatch::middleware::CircuitBreakerConfig;
use eventide_dispatch::{Backoff, BackoffKind, ReplayOptions, RetryPolicy};

use crate::error::ConfigError;

/// Where events, snapshots and dead letters live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// Process-local, lost on exit.
    #[default]
    Memory,
    /// JSON-lines log under the data directory.
    File,
    /// PostgreSQL via `DATABASE_URL`.
    Postgres,
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "file" => Ok(Self::File),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            other => Err(format!("unknown backend {other:?}, expected memory, file or postgres")),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line.
    #[default]
    Json,
    /// Human-readable, multi-line.
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => Err(format!("unknown log format {other:?}, expected json or pretty")),
        }
    }
}

/// Engine settings.
///
/// Build from the process environment with [`EngineConfig::from_env`], or
/// start from [`EngineConfig::default`] and adjust with the `with_*`
/// methods.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Storage backend.
    pub backend: Backend,
    /// Directory for the file backend, file snapshots and dead letters.
    pub data_dir: PathBuf,
    /// PostgreSQL connection string; required for [`Backend::Postgres`].
    pub database_url: Option<String>,
    /// Pool size for [`Backend::Postgres`].
    pub db_max_connections: u32,
    /// Snapshot every `n` events; `0` disables count-based snapshots.
    pub snapshot_every: u64,
    /// Snapshot when this much time has passed; `None` disables time-based
    /// snapshots.
    pub snapshot_interval: Option<Duration>,
    /// Handler retry policy.
    pub retry: RetryPolicy,
    /// Per-subscription circuit breaker.
    pub circuit: CircuitBreakerConfig,
    /// Dead-letter entries replayed at once.
    pub dlq_max_concurrency: usize,
    /// Dead-letter entries scheduled per replay batch.
    pub dlq_batch_size: usize,
    /// Failed replays before an entry is marked `MaxRetriesExceeded`.
    pub dlq_max_replay_attempts: u32,
    /// Log output format.
    pub log_format: LogFormat,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            data_dir: PathBuf::from("./eventide-data"),
            database_url: None,
            db_max_connections: 10,
            snapshot_every: 100,
            snapshot_interval: None,
            retry: RetryPolicy::default(),
            circuit: CircuitBreakerConfig::default(),
            dlq_max_concurrency: 4,
            dlq_batch_size: 50,
            dlq_max_replay_attempts: 5,
            log_format: LogFormat::Json,
        }
    }
}

impl EngineConfig {
    /// Reads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is malformed, or if the postgres
    /// backend is selected without `DATABASE_URL`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, which returns the value of
    /// a variable if set.
    ///
    /// # Errors
    ///
    /// See [`EngineConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { lookup: &lookup };
        let defaults = Self::default();
        let default_backoff = defaults.retry.backoff;

        let backend = env.parse("EVENTIDE_BACKEND")?.unwrap_or(defaults.backend);
        let database_url = env.get("DATABASE_URL");
        if backend == Backend::Postgres && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        let backoff = Backoff {
            kind: env
                .parse::<BackoffKind>("EVENTIDE_RETRY_BACKOFF")?
                .unwrap_or(default_backoff.kind),
            base_delay: env
                .millis("EVENTIDE_RETRY_BASE_DELAY_MS")?
                .unwrap_or(default_backoff.base_delay),
            max_delay: env
                .millis("EVENTIDE_RETRY_MAX_DELAY_MS")?
                .unwrap_or(default_backoff.max_delay),
            jitter: default_backoff.jitter,
        };
        let max_attempts = env
            .parse("EVENTIDE_RETRY_MAX_ATTEMPTS")?
            .unwrap_or(defaults.retry.max_attempts);

        let mut circuit = defaults.circuit;
        if let Some(threshold) = env.parse("EVENTIDE_CIRCUIT_FAILURE_THRESHOLD")? {
            circuit = circuit.failure_threshold(threshold);
        }
        if let Some(timeout) = env.millis("EVENTIDE_CIRCUIT_RESET_TIMEOUT_MS")? {
            circuit = circuit.reset_timeout(timeout);
        }

        let snapshot_interval = match env.parse::<u64>("EVENTIDE_SNAPSHOT_INTERVAL_SECS")? {
            Some(0) | None => None,
            Some(secs) => Some(Duration::from_secs(secs)),
        };

        Ok(Self {
            backend,
            data_dir: env.get("EVENTIDE_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            database_url,
            db_max_connections: env
                .parse("EVENTIDE_DB_MAX_CONNECTIONS")?
                .unwrap_or(defaults.db_max_connections),
            snapshot_every: env
                .parse("EVENTIDE_SNAPSHOT_EVERY")?
                .unwrap_or(defaults.snapshot_every),
            snapshot_interval,
            retry: RetryPolicy::new(max_attempts, backoff),
            circuit,
            dlq_max_concurrency: env
                .parse("EVENTIDE_DLQ_MAX_CONCURRENCY")?
                .unwrap_or(defaults.dlq_max_concurrency),
            dlq_batch_size: env
                .parse("EVENTIDE_DLQ_BATCH_SIZE")?
                .unwrap_or(defaults.dlq_batch_size),
            dlq_max_replay_attempts: env
                .parse("EVENTIDE_DLQ_MAX_REPLAY_ATTEMPTS")?
                .unwrap_or(defaults.dlq_max_replay_attempts),
            log_format: env
                .parse("EVENTIDE_LOG_FORMAT")?
                .unwrap_or(defaults.log_format),
        })
    }

    /// Sets the backend.
    #[must_use]
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Sets the data directory.
    #[must_use]
    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    /// Sets the PostgreSQL connection string.
    #[must_use]
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    /// Sets the count-based snapshot threshold; `0` disables it.
    #[must_use]
    pub fn with_snapshot_every(mut self, events: u64) -> Self {
        self.snapshot_every = events;
        self
    }

    /// Sets the time-based snapshot interval.
    #[must_use]
    pub fn with_snapshot_interval(mut self, interval: Option<Duration>) -> Self {
        self.snapshot_interval = interval;
        self
    }

    /// Sets the handler retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the circuit breaker.
    #[must_use]
    pub fn with_circuit(mut self, circuit: CircuitBreakerConfig) -> Self {
        self.circuit = circuit;
        self
    }

    /// Sets the dead-letter replay limit.
    #[must_use]
    pub fn with_dlq_max_replay_attempts(mut self, attempts: u32) -> Self {
        self.dlq_max_replay_attempts = attempts;
        self
    }

    /// Sets the log format.
    #[must_use]
    pub fn with_log_format(mut self, format: LogFormat) -> Self {
        self.log_format = format;
        self
    }

    /// Replay options derived from the dead-letter settings.
    #[must_use]
    pub fn replay_options(&self) -> ReplayOptions {
        ReplayOptions {
            max_concurrency: self.dlq_max_concurrency.max(1),
            batch_size: self.dlq_batch_size.max(1),
            ..ReplayOptions::default()
        }
    }
}

struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_owned())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|value| {
                value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                    key,
                    reason: e.to_string(),
                    value,
                })
            })
            .transpose()
    }

    fn millis(&self, key: &'static str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_millis))
    }
}
