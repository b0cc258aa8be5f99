//! Shared test doubles and utilities for the Eventide engine.

pub mod conformance;
mod clock;
mod counter;
mod store;

pub use clock::{FixedClock, ManualClock};
pub use counter::{Counter, CounterEvent};
pub use store::{FailingEventStore, RecordingEventStore};
