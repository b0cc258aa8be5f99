//! Eventide Core — shared event-sourcing abstractions.
//!
//! This crate defines the aggregate model, the event store and snapshot
//! store contracts, the upcasting pipeline and the canonical serialization
//! used for snapshots. It contains no infrastructure code; backends live in
//! `eventide-event-store`.

pub mod aggregate;
pub mod canonical;
pub mod clock;
pub mod error;
pub mod event;
pub mod notify;
pub mod snapshot;
pub mod store;
pub mod upcast;
