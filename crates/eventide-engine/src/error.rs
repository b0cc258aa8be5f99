//! Eventide Engine — startup error types.

use eventide_core::error::{EventStoreError, SnapshotError};
use eventide_dispatch::DeadLetterError;
use thiserror::Error;

/// A configuration value is missing or malformed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A required variable is not set.
    #[error("{0} must be set")]
    Missing(&'static str),

    /// A variable is set to a value that does not parse.
    #[error("{key}={value:?} is invalid: {reason}")]
    Invalid {
        /// The variable.
        key: &'static str,
        /// Its value.
        value: String,
        /// Parser message.
        reason: String,
    },
}

/// Errors raised while building the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration is missing or invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Database connection or pool error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// The event store could not be opened.
    #[error(transparent)]
    Store(#[from] EventStoreError),

    /// The snapshot store could not be opened.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    /// The dead-letter store could not be opened.
    #[error(transparent)]
    DeadLetter(#[from] DeadLetterError),

    /// A global tracing subscriber is already installed.
    #[error("tracing initialisation failed: {0}")]
    Telemetry(String),
}
