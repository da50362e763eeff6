//! Outbox relay.
//!
//! This crate provides the delivery side of the transactional outbox:
//! - [`Publisher`] trait for the destination of relayed events
//! - [`OutboxWorker`] for claiming, publishing and finalizing outbox records
//! - [`WorkerHandle`] for stopping a spawned worker

pub mod error;
pub mod publisher;
pub mod worker;

pub use error::{PublishError, RelayError, Result};
pub use publisher::{InMemoryPublisher, LogPublisher, PublishedMessage, Publisher};
pub use worker::{BatchReport, OutboxWorker, WorkerConfig, WorkerHandle};
