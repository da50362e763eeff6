//! Outbox relay daemon.
//!
//! Wires configuration, storage backend selection and the outbox worker
//! together. Logging and metrics exporters are installed by the binary.

pub mod config;
pub mod error;

use std::sync::Arc;

use relay::{LogPublisher, OutboxWorker, Publisher, WorkerHandle};
use sqlx::postgres::PgPoolOptions;
use storage::{InMemoryStore, OutboxStore, PostgresStore};
use tokio_util::sync::CancellationToken;

pub use config::{Config, LogFormat};
pub use error::{RelaydError, Result};

/// Starts an outbox worker over `store` as a background task.
pub fn start_worker<S: OutboxStore + 'static>(
    store: S,
    config: &Config,
    publisher: Arc<dyn Publisher>,
    shutdown: CancellationToken,
) -> WorkerHandle {
    OutboxWorker::new(store, publisher, config.worker_config()).spawn(shutdown)
}

/// Runs the relay until `shutdown` is cancelled.
///
/// Uses PostgreSQL when `DATABASE_URL` is configured, running migrations
/// first; otherwise relays from an empty in-memory store.
pub async fn run(config: Config, shutdown: CancellationToken) -> Result<()> {
    let publisher: Arc<dyn Publisher> = Arc::new(LogPublisher);

    let handle = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new().max_connections(5).connect(url).await?;
            let store = PostgresStore::new(pool);
            store.run_migrations().await?;
            tracing::info!("using PostgreSQL outbox");
            start_worker(store, &config, publisher, shutdown.clone())
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory outbox");
            start_worker(InMemoryStore::new(), &config, publisher, shutdown.clone())
        }
    };

    shutdown.cancelled().await;
    handle.shutdown().await?;
    Ok(())
}
