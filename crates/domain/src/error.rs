//! Domain error types.

use storage::{Classify, ErrorClass, StorageError};
use thiserror::Error;

use crate::context::ContextError;

/// Errors that can occur during domain operations.
#[derive(Debug, Error)]
pub enum DomainError {
    /// An error occurred in the storage layer.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// A business rule rejected the operation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,

    /// The operation ran past its deadline.
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// A unit-of-work scope was used after its transaction finished.
    #[error("Unit of work scope is closed")]
    ScopeClosed,

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DomainError {
    pub fn validation(message: impl Into<String>) -> Self {
        DomainError::Validation(message.into())
    }

    /// Returns true if this is an optimistic-lock conflict.
    pub fn is_concurrent_modification(&self) -> bool {
        self.class() == ErrorClass::ConcurrentModification
    }

    /// Returns true if the target aggregate does not exist.
    pub fn is_not_found(&self) -> bool {
        self.class() == ErrorClass::NotFound
    }
}

impl From<ContextError> for DomainError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::Cancelled => DomainError::Cancelled,
            ContextError::DeadlineExceeded => DomainError::DeadlineExceeded,
        }
    }
}

impl Classify for DomainError {
    fn class(&self) -> ErrorClass {
        match self {
            DomainError::Storage(err) => err.class(),
            DomainError::Validation(_) => ErrorClass::Validation,
            DomainError::Cancelled
            | DomainError::DeadlineExceeded
            | DomainError::ScopeClosed
            | DomainError::Serialization(_) => ErrorClass::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::{AggregateId, Version};

    #[test]
    fn storage_errors_keep_their_class() {
        let err = DomainError::from(StorageError::Deadlock("40P01".to_string()));
        assert_eq!(err.class(), ErrorClass::Deadlock);

        let err = DomainError::from(StorageError::ConcurrentModification {
            aggregate_type: "User".to_string(),
            aggregate_id: AggregateId::new(),
            expected: Version::first(),
        });
        assert!(err.is_concurrent_modification());
    }

    #[test]
    fn context_errors_are_terminal() {
        let err = DomainError::from(ContextError::DeadlineExceeded);
        assert!(matches!(err, DomainError::DeadlineExceeded));
        assert_eq!(err.class(), ErrorClass::Other);
        assert_eq!(
            DomainError::from(ContextError::Cancelled).class(),
            ErrorClass::Other
        );
    }

    #[test]
    fn validation_class() {
        let err = DomainError::validation("email is required");
        assert_eq!(err.class(), ErrorClass::Validation);
        assert_eq!(err.to_string(), "Validation error: email is required");
    }
}
