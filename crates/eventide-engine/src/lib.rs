//! Eventide Engine — composition root.
//!
//! Reads [`config::EngineConfig`] from the environment, installs tracing and
//! wires the event store, snapshot store, dead-letter queue and dispatcher
//! into an [`context::EngineContext`]. Every collaborator is passed in or
//! built here explicitly; nothing is looked up globally.

pub mod config;
pub mod context;
pub mod error;
pub mod telemetry;

pub use config::{Backend, EngineConfig, LogFormat};
pub use context::EngineContext;
pub use error::{ConfigError, EngineError};
