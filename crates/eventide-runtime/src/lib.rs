//! Eventide Runtime — loading, saving and transactional mutation of
//! aggregates.
//!
//! [`repository::AggregateRepository`] rebuilds aggregates from the latest
//! usable snapshot plus the events recorded after it, upcasting each event
//! on the way. [`unit_of_work::UnitOfWork`] groups mutations of several
//! aggregates into one all-or-nothing commit and forwards the committed
//! events to a [`publisher::EventPublisher`].

pub mod error;
pub mod publisher;
pub mod repository;
pub mod unit_of_work;

pub use error::{StreamConflict, UnitOfWorkError};
pub use publisher::EventPublisher;
pub use repository::AggregateRepository;
pub use unit_of_work::{UnitOfWork, UnitState};
