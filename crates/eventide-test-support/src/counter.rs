//! A small aggregate used throughout the workspace's tests.

use eventide_core::event::{DomainEvent, decode_tagged, encode_tagged};
use eventide_core::aggregate::AggregateState;
use serde::{Deserialize, Serialize};

/// Events of the [`Counter`] aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum CounterEvent {
    /// Adds `by` to the total.
    #[serde(rename = "counter.incremented")]
    Incremented { by: i64 },
    /// Subtracts `by` from the total.
    #[serde(rename = "counter.decremented")]
    Decremented { by: i64 },
    /// Sets the total back to zero.
    #[serde(rename = "counter.reset")]
    Reset,
}

impl DomainEvent for CounterEvent {
    const EVENT_TYPES: &'static [&'static str] =
        &["counter.incremented", "counter.decremented", "counter.reset"];

    fn event_type(&self) -> &'static str {
        match self {
            Self::Incremented { .. } => "counter.incremented",
            Self::Decremented { .. } => "counter.decremented",
            Self::Reset => "counter.reset",
        }
    }

    fn to_payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        encode_tagged(self)
    }

    fn from_payload(event_type: &str, payload: serde_json::Value) -> Result<Self, serde_json::Error> {
        decode_tagged(event_type, payload)
    }
}

/// Counter state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    /// Running total.
    pub total: i64,
    /// Number of events applied.
    pub changes: u64,
}

impl AggregateState for Counter {
    type Event = CounterEvent;
    const AGGREGATE_TYPE: &'static str = "Counter";

    fn transition(&mut self, event: &CounterEvent) {
        match event {
            CounterEvent::Incremented { by } => self.total += by,
            CounterEvent::Decremented { by } => self.total -= by,
            CounterEvent::Reset => self.total = 0,
        }
        self.changes += 1;
    }
}
