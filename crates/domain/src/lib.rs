//! Domain layer: aggregates, optimistic repositories and the unit of work.
//!
//! This crate provides:
//! - AggregateRoot trait for state-persisted entities that record domain events
//! - StateRepository, a version-checked repository for any serde aggregate
//! - RetryPolicy with error classification and jittered exponential backoff
//! - UnitOfWork, which commits aggregate state and its outbox events atomically
//! - Sample User and Order aggregates

pub mod aggregate;
pub mod context;
pub mod error;
pub mod order;
pub mod repository;
pub mod retry;
pub mod unit_of_work;
pub mod user;

pub use aggregate::{AggregateRoot, PendingEvents};
pub use context::{ContextError, ExecContext};
pub use error::DomainError;
pub use order::{Order, OrderLine, OrderStatus};
pub use repository::{AggregateRepository, StateRepository};
pub use retry::{RetryConfig, RetryPolicy};
pub use unit_of_work::{UnitOfWork, UnitOfWorkConfig, UnitOfWorkScope};
pub use user::User;
