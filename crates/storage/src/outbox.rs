use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AggregateId, DomainEvent, Result, StorageError};

/// Delivery status of an outbox record.
///
/// ```text
/// Pending ──claim──▶ Processing ──publish ok──▶ Published
///    ▲                   │
///    └──publish failed───┤ (retry_count < max, or stale claim)
///                        └──publish failed──▶ Failed (retry_count >= max)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Published,
    Failed,
}

impl OutboxStatus {
    /// Returns the value stored in the `status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Processing => "PROCESSING",
            OutboxStatus::Published => "PUBLISHED",
            OutboxStatus::Failed => "FAILED",
        }
    }

    /// Published and Failed records are never picked up again automatically.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Published | OutboxStatus::Failed)
    }

    /// Returns whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: OutboxStatus) -> bool {
        matches!(
            (self, next),
            (OutboxStatus::Pending, OutboxStatus::Processing)
                | (OutboxStatus::Processing, OutboxStatus::Published)
                | (OutboxStatus::Processing, OutboxStatus::Pending)
                | (OutboxStatus::Processing, OutboxStatus::Failed)
        )
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(OutboxStatus::Pending),
            "PROCESSING" => Ok(OutboxStatus::Processing),
            "PUBLISHED" => Ok(OutboxStatus::Published),
            "FAILED" => Ok(OutboxStatus::Failed),
            other => Err(StorageError::Corrupt(format!(
                "invalid outbox status: {other}"
            ))),
        }
    }
}

/// A domain event waiting for, or done with, delivery.
///
/// The record id is the id of the event it carries, so downstream consumers
/// can de-duplicate repeated deliveries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: Uuid,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxRecord {
    /// Creates a pending record for an event.
    pub fn from_event(event: &DomainEvent, now: DateTime<Utc>) -> Self {
        Self {
            id: event.event_id().as_uuid(),
            aggregate_id: event.aggregate_id(),
            aggregate_type: event.aggregate_type().to_string(),
            event_type: event.event_type().to_string(),
            payload: event.payload().clone(),
            status: OutboxStatus::Pending,
            retry_count: 0,
            last_error: None,
            occurred_at: event.occurred_at(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Per-status counts of outbox records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboxStats {
    pub pending: u64,
    pub processing: u64,
    pub published: u64,
    pub failed: u64,
    /// Creation time of the oldest pending record, if any.
    pub oldest_pending: Option<DateTime<Utc>>,
}

/// Delivery-side access to the outbox.
///
/// Inserts happen through [`crate::Transaction::save_event`] so they share the
/// aggregate's transaction. Every status change here is a conditional update
/// on the current status, which keeps independent workers from stepping on
/// each other without row locks.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Returns up to `limit` pending records, oldest first.
    async fn get_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>>;

    /// Moves a record from Pending to Processing.
    ///
    /// Returns false when the record was no longer pending, i.e. another
    /// worker claimed it first.
    async fn claim(&self, id: Uuid) -> Result<bool>;

    /// Moves a claimed record to Published.
    ///
    /// Fails with [`StorageError::OutboxTransition`] if the record is not
    /// Processing.
    async fn mark_published(&self, id: Uuid) -> Result<()>;

    /// Records a failed publish attempt on a claimed record.
    ///
    /// Increments `retry_count`; the record returns to Pending while the new
    /// count is below `max_retries` and becomes Failed otherwise. Returns the
    /// resulting status.
    async fn mark_failed(&self, id: Uuid, max_retries: i32, error: &str) -> Result<OutboxStatus>;

    /// Returns Processing records last touched before `older_than` to Pending.
    ///
    /// Recovers claims abandoned by a worker that stopped mid-delivery.
    /// `retry_count` is left unchanged. Returns the number of records moved.
    async fn requeue_stale(&self, older_than: DateTime<Utc>) -> Result<u64>;

    /// Fetches a single record.
    async fn get(&self, id: Uuid) -> Result<Option<OutboxRecord>>;

    /// Counts records per status.
    async fn stats(&self) -> Result<OutboxStats>;
}
