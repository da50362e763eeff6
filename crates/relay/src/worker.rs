//! Polling worker that drains the outbox.

use std::sync::Arc;
use std::time::Duration;

use common::{Clock, SystemClock};
use storage::{OutboxRecord, OutboxStore};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::error::PublishError;
use crate::publisher::Publisher;

/// Configuration for the outbox worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often to poll for pending records
    pub poll_interval: Duration,

    /// Maximum records fetched per cycle
    pub batch_size: usize,

    /// Failed publishes allowed before a record becomes Failed
    pub max_retries: i32,

    /// Processing records untouched for this long are returned to Pending
    pub stale_after: Duration,

    /// Upper bound for a single publish call
    pub publish_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
            max_retries: 5,
            stale_after: Duration::from_secs(300),
            publish_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    /// Shortest `stale_after` allowed for a given `publish_timeout`.
    ///
    /// A claim must not be reclaimed while its publish may still be running,
    /// otherwise a second worker delivers the same record.
    pub fn min_stale_after(publish_timeout: Duration) -> Duration {
        publish_timeout.saturating_mul(2)
    }

    /// Returns the config with unsafe values raised to their minimum.
    pub fn validated(mut self) -> Self {
        let floor = Self::min_stale_after(self.publish_timeout);
        if self.stale_after < floor {
            tracing::warn!(
                stale_after_secs = self.stale_after.as_secs(),
                publish_timeout_secs = self.publish_timeout.as_secs(),
                "stale_after too short for publish_timeout, raising it"
            );
            self.stale_after = floor;
        }
        if self.poll_interval.is_zero() {
            self.poll_interval = WorkerConfig::default().poll_interval;
        }
        self
    }
}

/// What one polling cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Stale claims returned to Pending before fetching
    pub recovered: u64,
    /// Pending records fetched
    pub fetched: usize,
    /// Records this worker claimed
    pub claimed: usize,
    /// Records another worker claimed first
    pub skipped: usize,
    pub published: usize,
    /// Failed publishes sent back to Pending
    pub requeued: usize,
    /// Failed publishes that exhausted their retries
    pub failed: usize,
    /// Records abandoned because the store failed mid-way
    pub errors: usize,
    /// Pending records left after the cycle
    pub backlog: u64,
}

impl BatchReport {
    /// Returns true if the cycle found nothing to do.
    pub fn is_idle(&self) -> bool {
        self.recovered == 0 && self.fetched == 0
    }
}

enum Outcome {
    Skipped,
    Published,
    Requeued,
    Failed,
}

/// Delivers outbox records to a [`Publisher`].
///
/// Each cycle:
/// 1. Returns stale Processing records to Pending
/// 2. Fetches up to `batch_size` pending records, oldest first
/// 3. Claims each one; records another worker claimed are skipped
/// 4. Publishes claimed records and marks them Published, or records the failure
///
/// Records are handled independently, so one failure never holds up the rest
/// of the batch. Several workers may share a store.
pub struct OutboxWorker<S> {
    store: S,
    publisher: Arc<dyn Publisher>,
    config: WorkerConfig,
    clock: Arc<dyn Clock>,
}

impl<S: OutboxStore> OutboxWorker<S> {
    pub fn new(store: S, publisher: Arc<dyn Publisher>, config: WorkerConfig) -> Self {
        Self {
            store,
            publisher,
            config: config.validated(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Uses `clock` to decide which claims are stale.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Runs a single polling cycle.
    ///
    /// Fails only if recovery or the initial fetch fails; per-record store
    /// errors are logged and counted in [`BatchReport::errors`].
    #[tracing::instrument(skip(self))]
    pub async fn run_once(&self) -> Result<BatchReport> {
        let mut report = BatchReport {
            recovered: self.recover_stale().await?,
            ..BatchReport::default()
        };

        let records = self.store.get_pending(self.config.batch_size).await?;
        report.fetched = records.len();

        for record in &records {
            match self.deliver(record).await {
                Ok(Outcome::Skipped) => report.skipped += 1,
                Ok(outcome) => {
                    report.claimed += 1;
                    match outcome {
                        Outcome::Published => report.published += 1,
                        Outcome::Requeued => report.requeued += 1,
                        Outcome::Failed => report.failed += 1,
                        Outcome::Skipped => {}
                    }
                }
                Err(err) => {
                    report.errors += 1;
                    tracing::warn!(record_id = %record.id, error = %err, "outbox record not finalized");
                }
            }
        }

        report.backlog = self.record_backlog().await;
        Ok(report)
    }

    /// Publishes outbox gauges and returns the pending count.
    async fn record_backlog(&self) -> u64 {
        let stats = match self.store.stats().await {
            Ok(stats) => stats,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read outbox stats");
                return 0;
            }
        };

        let oldest_age = stats.oldest_pending.map_or(0.0, |oldest| {
            (self.clock.now() - oldest).num_milliseconds().max(0) as f64 / 1000.0
        });
        metrics::gauge!("outbox_pending").set(stats.pending as f64);
        metrics::gauge!("outbox_processing").set(stats.processing as f64);
        metrics::gauge!("outbox_failed").set(stats.failed as f64);
        metrics::gauge!("outbox_oldest_pending_age_seconds").set(oldest_age);
        stats.pending
    }

    async fn recover_stale(&self) -> Result<u64> {
        let cutoff = chrono::Duration::from_std(self.config.stale_after)
            .ok()
            .and_then(|age| self.clock.now().checked_sub_signed(age));
        let Some(cutoff) = cutoff else {
            return Ok(0);
        };

        let recovered = self.store.requeue_stale(cutoff).await?;
        if recovered > 0 {
            metrics::counter!("outbox_recovered_total").increment(recovered);
            tracing::warn!(recovered, %cutoff, "requeued stale outbox claims");
        }
        Ok(recovered)
    }

    #[tracing::instrument(
        skip(self, record),
        fields(record_id = %record.id, event_type = %record.event_type)
    )]
    async fn deliver(&self, record: &OutboxRecord) -> Result<Outcome> {
        if !self.store.claim(record.id).await? {
            tracing::debug!("record already claimed by another worker");
            return Ok(Outcome::Skipped);
        }

        match self.publish(record).await {
            Ok(()) => {
                self.store.mark_published(record.id).await?;
                metrics::counter!("outbox_published_total").increment(1);
                tracing::debug!("record published");
                Ok(Outcome::Published)
            }
            Err(err) => {
                let status = self
                    .store
                    .mark_failed(record.id, self.config.max_retries, &err.to_string())
                    .await?;
                let attempts = record.retry_count + 1;

                if status.is_terminal() {
                    metrics::counter!("outbox_failed_total").increment(1);
                    tracing::error!(attempts, error = %err, "record failed permanently");
                    Ok(Outcome::Failed)
                } else {
                    metrics::counter!("outbox_requeued_total").increment(1);
                    tracing::warn!(attempts, error = %err, "publish failed, record requeued");
                    Ok(Outcome::Requeued)
                }
            }
        }
    }

    async fn publish(&self, record: &OutboxRecord) -> std::result::Result<(), PublishError> {
        let timeout = self.config.publish_timeout;
        match tokio::time::timeout(
            timeout,
            self.publisher.publish(&record.event_type, &record.payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(PublishError::Timeout(timeout)),
        }
    }

    /// Polls until `shutdown` is cancelled.
    ///
    /// A cycle in progress when shutdown arrives runs to completion.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            max_retries = self.config.max_retries,
            "starting outbox worker"
        );

        let mut tick = tokio::time::interval(self.config.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::info!("shutdown signal received, stopping outbox worker");
                    break;
                }
                _ = tick.tick() => match self.run_once().await {
                    Ok(report) if report.is_idle() => {}
                    Ok(report) => tracing::info!(
                        recovered = report.recovered,
                        fetched = report.fetched,
                        published = report.published,
                        requeued = report.requeued,
                        failed = report.failed,
                        skipped = report.skipped,
                        errors = report.errors,
                        "outbox batch processed"
                    ),
                    Err(err) => tracing::warn!(error = %err, "outbox cycle failed"),
                },
            }
        }

        tracing::info!("outbox worker stopped");
    }
}

impl<S: OutboxStore + 'static> OutboxWorker<S> {
    /// Starts the polling loop as a background task.
    ///
    /// The task stops when `shutdown` or the returned handle is cancelled.
    pub fn spawn(self, shutdown: CancellationToken) -> WorkerHandle {
        let token = shutdown.child_token();
        let task_token = token.clone();
        let join = tokio::spawn(async move { self.run(task_token).await });
        WorkerHandle { token, join }
    }
}

/// Handle to a spawned [`OutboxWorker`].
pub struct WorkerHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signals the worker to stop and waits for it to finish.
    pub async fn shutdown(self) -> std::result::Result<(), JoinError> {
        self.token.cancel();
        self.join.await
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}
