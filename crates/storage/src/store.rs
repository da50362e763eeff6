use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{AggregateId, DomainEvent, Result, Version};

/// Stored form of an aggregate: its JSON state plus the version column.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRow {
    pub aggregate_type: String,
    pub aggregate_id: AggregateId,
    pub version: Version,
    pub state: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A storage transaction.
///
/// Everything written through one transaction becomes visible together on
/// [`commit`](Transaction::commit), or not at all. Dropping a transaction
/// without committing rolls it back.
#[async_trait]
pub trait Transaction: Send {
    /// Reads an aggregate row, including writes staged by this transaction.
    async fn load_aggregate(
        &mut self,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<Option<AggregateRow>>;

    /// Returns whether an aggregate row exists.
    async fn aggregate_exists(&mut self, aggregate_type: &str, aggregate_id: AggregateId)
    -> Result<bool>;

    /// Inserts a new aggregate row at [`Version::first`].
    ///
    /// Fails with [`crate::StorageError::Duplicate`] if the row already exists.
    async fn insert_aggregate(
        &mut self,
        aggregate_type: &str,
        aggregate_id: AggregateId,
        state: &serde_json::Value,
    ) -> Result<()>;

    /// Overwrites the state of the row whose version equals `expected` and
    /// sets its version to `expected + 1`.
    ///
    /// Returns the number of rows affected: 0 when the row is missing or its
    /// version differs.
    async fn update_aggregate(
        &mut self,
        aggregate_type: &str,
        aggregate_id: AggregateId,
        expected: Version,
        state: &serde_json::Value,
    ) -> Result<u64>;

    /// Deletes the row whose version equals `expected`. Returns rows affected.
    async fn delete_aggregate(
        &mut self,
        aggregate_type: &str,
        aggregate_id: AggregateId,
        expected: Version,
    ) -> Result<u64>;

    /// Inserts a pending outbox record for `event` in this transaction.
    async fn save_event(&mut self, event: &DomainEvent) -> Result<()>;

    /// Makes every staged write durable and visible.
    async fn commit(self) -> Result<()>;

    /// Discards every staged write.
    async fn rollback(self) -> Result<()>;
}

/// A transactional storage provider.
#[async_trait]
pub trait Store: Send + Sync {
    type Tx: Transaction + 'static;

    /// Opens a new transaction.
    async fn begin(&self) -> Result<Self::Tx>;
}
