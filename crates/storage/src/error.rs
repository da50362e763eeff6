use thiserror::Error;
use uuid::Uuid;

use crate::{AggregateId, OutboxStatus, Version};

/// Errors that can occur when interacting with storage.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The aggregate row does not exist.
    #[error("Aggregate not found: {aggregate_type} with id {aggregate_id}")]
    NotFound {
        aggregate_type: String,
        aggregate_id: AggregateId,
    },

    /// A version-checked write lost the race against another writer.
    #[error(
        "Concurrent modification of {aggregate_type} {aggregate_id}: expected version {expected}"
    )]
    ConcurrentModification {
        aggregate_type: String,
        aggregate_id: AggregateId,
        expected: Version,
    },

    /// The database aborted the transaction to break a deadlock.
    #[error("Deadlock detected: {0}")]
    Deadlock(String),

    /// Waiting for a row lock exceeded the lock timeout.
    #[error("Lock wait timeout: {0}")]
    LockTimeout(String),

    /// The connection to the database was lost or could not be acquired.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// A uniqueness constraint was violated.
    #[error("Duplicate key: {0}")]
    Duplicate(String),

    /// An outbox record was not in the status a transition requires.
    #[error("Outbox record {record_id} is not {expected}")]
    OutboxTransition {
        record_id: Uuid,
        expected: OutboxStatus,
    },

    /// Stored data could not be interpreted.
    #[error("Corrupt stored value: {0}")]
    Corrupt(String),

    /// Any other database error.
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Coarse classification used by retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    NotFound,
    ConcurrentModification,
    Validation,
    Deadlock,
    LockTimeout,
    ConnectionLost,
    Duplicate,
    Other,
}

impl ErrorClass {
    /// Infrastructure failures that may succeed if the whole operation is repeated.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorClass::Deadlock | ErrorClass::LockTimeout | ErrorClass::ConnectionLost
        )
    }
}

/// Maps an error onto an [`ErrorClass`].
pub trait Classify {
    fn class(&self) -> ErrorClass;
}

impl Classify for StorageError {
    fn class(&self) -> ErrorClass {
        match self {
            StorageError::NotFound { .. } => ErrorClass::NotFound,
            StorageError::ConcurrentModification { .. } => ErrorClass::ConcurrentModification,
            StorageError::Deadlock(_) => ErrorClass::Deadlock,
            StorageError::LockTimeout(_) => ErrorClass::LockTimeout,
            StorageError::ConnectionLost(_) => ErrorClass::ConnectionLost,
            StorageError::Duplicate(_) => ErrorClass::Duplicate,
            StorageError::OutboxTransition { .. }
            | StorageError::Corrupt(_)
            | StorageError::Database(_)
            | StorageError::Migration(_)
            | StorageError::Serialization(_) => ErrorClass::Other,
        }
    }
}

// PostgreSQL SQLSTATE codes.
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const LOCK_NOT_AVAILABLE: &str = "55P03";
const UNIQUE_VIOLATION: &str = "23505";
const CONNECTION_EXCEPTION_CLASS: &str = "08";

fn classify_sqlx(err: &sqlx::Error) -> ErrorClass {
    match err {
        sqlx::Error::Database(db) => match db.code() {
            Some(code) if code == DEADLOCK_DETECTED || code == SERIALIZATION_FAILURE => {
                ErrorClass::Deadlock
            }
            Some(code) if code == LOCK_NOT_AVAILABLE => ErrorClass::LockTimeout,
            Some(code) if code == UNIQUE_VIOLATION => ErrorClass::Duplicate,
            Some(code) if code.starts_with(CONNECTION_EXCEPTION_CLASS) => {
                ErrorClass::ConnectionLost
            }
            _ => ErrorClass::Other,
        },
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => ErrorClass::ConnectionLost,
        _ => ErrorClass::Other,
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match classify_sqlx(&err) {
            ErrorClass::Deadlock => StorageError::Deadlock(err.to_string()),
            ErrorClass::LockTimeout => StorageError::LockTimeout(err.to_string()),
            ErrorClass::Duplicate => StorageError::Duplicate(err.to_string()),
            ErrorClass::ConnectionLost => StorageError::ConnectionLost(err.to_string()),
            _ => StorageError::Database(err),
        }
    }
}
