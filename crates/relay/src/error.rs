//! Relay error types.

use std::time::Duration;

use storage::{Classify, ErrorClass, StorageError};
use thiserror::Error;

/// Why a publish target refused or failed to take an event.
#[derive(Debug, Clone, Error)]
pub enum PublishError {
    /// The target could not be reached.
    #[error("Publish target unavailable: {0}")]
    Unavailable(String),

    /// The target received the event and rejected it.
    #[error("Publish rejected: {0}")]
    Rejected(String),

    /// The target did not answer in time.
    #[error("Publish timed out after {0:?}")]
    Timeout(Duration),
}

impl Classify for PublishError {
    fn class(&self) -> ErrorClass {
        match self {
            PublishError::Unavailable(_) | PublishError::Timeout(_) => ErrorClass::ConnectionLost,
            PublishError::Rejected(_) => ErrorClass::Other,
        }
    }
}

/// Errors that can occur while relaying outbox records.
#[derive(Debug, Error)]
pub enum RelayError {
    /// An error occurred in the outbox store.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// The publish target failed.
    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),
}

impl Classify for RelayError {
    fn class(&self) -> ErrorClass {
        match self {
            RelayError::Storage(err) => err.class(),
            RelayError::Publish(err) => err.class(),
        }
    }
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_errors_are_classified() {
        assert!(PublishError::Unavailable("broker down".into()).class().is_transient());
        assert!(PublishError::Timeout(Duration::from_secs(1)).class().is_transient());
        assert_eq!(
            PublishError::Rejected("schema".into()).class(),
            ErrorClass::Other
        );
    }

    #[test]
    fn relay_error_keeps_inner_class() {
        let err = RelayError::from(StorageError::ConnectionLost("reset".into()));
        assert_eq!(err.class(), ErrorClass::ConnectionLost);

        let err = RelayError::from(PublishError::Rejected("schema".into()));
        assert_eq!(err.class(), ErrorClass::Other);
    }
}
