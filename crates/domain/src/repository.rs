//! Optimistic-locking aggregate repositories.

use std::marker::PhantomData;

use async_trait::async_trait;
use common::{AggregateId, Version};
use serde::{Serialize, de::DeserializeOwned};
use storage::{StorageError, Transaction};

use crate::aggregate::AggregateRoot;

/// Persists one aggregate type inside a caller-owned transaction.
///
/// Repositories never touch events; the unit of work drains them after a save.
#[async_trait]
pub trait AggregateRepository: Send + Sync {
    type Aggregate: AggregateRoot;

    /// Inserts a new aggregate or performs a version-checked update.
    ///
    /// On success the aggregate's version matches the stored one. A stale
    /// version fails with [`StorageError::ConcurrentModification`]; a row that
    /// disappeared fails with [`StorageError::NotFound`].
    async fn save<T: Transaction>(
        &self,
        tx: &mut T,
        aggregate: &mut Self::Aggregate,
    ) -> Result<(), StorageError>;

    /// Loads an aggregate, returning None if it doesn't exist.
    async fn find_by_id<T: Transaction>(
        &self,
        tx: &mut T,
        id: AggregateId,
    ) -> Result<Option<Self::Aggregate>, StorageError>;

    /// Deletes an aggregate at its current version.
    async fn remove<T: Transaction>(
        &self,
        tx: &mut T,
        aggregate: &Self::Aggregate,
    ) -> Result<(), StorageError>;
}

/// Repository storing any serde-capable aggregate as JSON state.
pub struct StateRepository<A> {
    _phantom: PhantomData<fn() -> A>,
}

impl<A> StateRepository<A> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<A> Default for StateRepository<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> Clone for StateRepository<A> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<A> std::fmt::Debug for StateRepository<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateRepository")
            .field("aggregate", &std::any::type_name::<A>())
            .finish()
    }
}

/// Explains why a version-checked write matched no row.
async fn missed_write<T: Transaction>(
    tx: &mut T,
    aggregate_type: &str,
    aggregate_id: AggregateId,
    expected: Version,
) -> StorageError {
    match tx.aggregate_exists(aggregate_type, aggregate_id).await {
        Ok(true) => StorageError::ConcurrentModification {
            aggregate_type: aggregate_type.to_string(),
            aggregate_id,
            expected,
        },
        Ok(false) => StorageError::NotFound {
            aggregate_type: aggregate_type.to_string(),
            aggregate_id,
        },
        Err(err) => err,
    }
}

#[async_trait]
impl<A> AggregateRepository for StateRepository<A>
where
    A: AggregateRoot + Serialize + DeserializeOwned + 'static,
{
    type Aggregate = A;

    #[tracing::instrument(
        skip(self, tx, aggregate),
        fields(aggregate_type = A::aggregate_type(), aggregate_id = %aggregate.id())
    )]
    async fn save<T: Transaction>(&self, tx: &mut T, aggregate: &mut A) -> Result<(), StorageError> {
        let aggregate_type = A::aggregate_type();
        let aggregate_id = aggregate.id();
        let state = serde_json::to_value(&*aggregate)?;

        if aggregate.is_new() {
            tx.insert_aggregate(aggregate_type, aggregate_id, &state)
                .await?;
            aggregate.set_version(Version::first());
            tracing::debug!("aggregate inserted");
            return Ok(());
        }

        let expected = aggregate.version();
        let affected = tx
            .update_aggregate(aggregate_type, aggregate_id, expected, &state)
            .await?;
        if affected == 0 {
            let err = missed_write(tx, aggregate_type, aggregate_id, expected).await;
            tracing::debug!(expected = %expected, error = %err, "version-checked update missed");
            return Err(err);
        }

        aggregate.set_version(expected.next());
        tracing::debug!(version = %aggregate.version(), "aggregate updated");
        Ok(())
    }

    async fn find_by_id<T: Transaction>(
        &self,
        tx: &mut T,
        id: AggregateId,
    ) -> Result<Option<A>, StorageError> {
        let Some(row) = tx.load_aggregate(A::aggregate_type(), id).await? else {
            return Ok(None);
        };

        let mut aggregate: A = serde_json::from_value(row.state)?;
        if aggregate.id() != id {
            return Err(StorageError::Corrupt(format!(
                "{} row {id} holds state for {}",
                A::aggregate_type(),
                aggregate.id()
            )));
        }
        aggregate.set_version(row.version);
        Ok(Some(aggregate))
    }

    #[tracing::instrument(
        skip(self, tx, aggregate),
        fields(aggregate_type = A::aggregate_type(), aggregate_id = %aggregate.id())
    )]
    async fn remove<T: Transaction>(&self, tx: &mut T, aggregate: &A) -> Result<(), StorageError> {
        let aggregate_type = A::aggregate_type();
        let aggregate_id = aggregate.id();
        let expected = aggregate.version();

        let affected = tx
            .delete_aggregate(aggregate_type, aggregate_id, expected)
            .await?;
        if affected == 0 {
            return Err(missed_write(tx, aggregate_type, aggregate_id, expected).await);
        }
        Ok(())
    }
}
