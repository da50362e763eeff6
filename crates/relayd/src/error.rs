//! Daemon error types.

use thiserror::Error;

/// Errors that stop the relay daemon.
#[derive(Debug, Error)]
pub enum RelaydError {
    /// The database could not be reached.
    #[error("Database connection failed: {0}")]
    Connect(#[from] sqlx::Error),

    /// Storage setup failed.
    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    /// The Prometheus exporter could not be installed.
    #[error("Metrics exporter error: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    /// The worker task panicked or was aborted.
    #[error("Worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// Result type for daemon operations.
pub type Result<T> = std::result::Result<T, RelaydError>;
