//! Transactional storage for aggregate state and the event outbox.
//!
//! Aggregate rows and outbox records are written through a [`Transaction`]
//! so that a state change and the events it produced commit together.
//! Delivery-side operations live on [`OutboxStore`].

pub mod error;
pub mod event;
pub mod memory;
pub mod outbox;
pub mod postgres;
pub mod store;

pub use common::{AggregateId, Clock, SystemClock, Version};
pub use error::{Classify, ErrorClass, Result, StorageError};
pub use event::{DomainEvent, EventId};
pub use memory::{Fault, InMemoryStore, InMemoryTransaction};
pub use outbox::{OutboxRecord, OutboxStats, OutboxStatus, OutboxStore};
pub use postgres::{PostgresStore, PostgresTransaction};
pub use store::{AggregateRow, Store, Transaction};
