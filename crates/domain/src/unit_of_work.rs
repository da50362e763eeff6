//! Atomic persistence of aggregate state together with its events.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use common::AggregateId;
use storage::{DomainEvent, StorageError, Store, Transaction};
use tokio::sync::Mutex;

use crate::aggregate::AggregateRoot;
use crate::context::ExecContext;
use crate::error::DomainError;
use crate::repository::AggregateRepository;
use crate::retry::{RetryConfig, RetryPolicy};

#[derive(Clone, Debug)]
pub struct UnitOfWorkConfig {
    /// Per-attempt time limit applied when the caller's context has no deadline
    pub default_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for UnitOfWorkConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

struct ScopeState<T> {
    tx: T,
    events: Vec<DomainEvent>,
}

/// Handle to the transaction of one unit-of-work attempt.
///
/// Repositories called through the scope share its transaction, and every
/// aggregate saved or removed through it has its pending events drained into
/// the scope. The handle is cheap to clone; once the attempt finishes, any
/// further use fails with [`DomainError::ScopeClosed`].
pub struct UnitOfWorkScope<T> {
    state: Arc<Mutex<Option<ScopeState<T>>>>,
}

impl<T> Clone for UnitOfWorkScope<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Transaction> UnitOfWorkScope<T> {
    fn pending() -> Self {
        Self {
            state: Arc::new(Mutex::new(None)),
        }
    }

    async fn open(&self, tx: T) {
        *self.state.lock().await = Some(ScopeState {
            tx,
            events: Vec::new(),
        });
    }

    async fn close(&self) -> Option<ScopeState<T>> {
        self.state.lock().await.take()
    }

    /// Loads an aggregate inside the transaction.
    pub async fn find<R: AggregateRepository>(
        &self,
        repo: &R,
        id: AggregateId,
    ) -> Result<Option<R::Aggregate>, DomainError> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or(DomainError::ScopeClosed)?;
        Ok(repo.find_by_id(&mut state.tx, id).await?)
    }

    /// Loads an aggregate that must exist.
    pub async fn load<R: AggregateRepository>(
        &self,
        repo: &R,
        id: AggregateId,
    ) -> Result<R::Aggregate, DomainError> {
        self.find(repo, id).await?.ok_or_else(|| {
            DomainError::Storage(StorageError::NotFound {
                aggregate_type: <R::Aggregate as AggregateRoot>::aggregate_type().to_string(),
                aggregate_id: id,
            })
        })
    }

    /// Saves an aggregate and registers its pending events for the outbox.
    pub async fn save<R: AggregateRepository>(
        &self,
        repo: &R,
        aggregate: &mut R::Aggregate,
    ) -> Result<(), DomainError> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or(DomainError::ScopeClosed)?;
        repo.save(&mut state.tx, aggregate).await?;
        state.events.extend(aggregate.pull_events());
        Ok(())
    }

    /// Deletes an aggregate and registers its pending events for the outbox.
    pub async fn remove<R: AggregateRepository>(
        &self,
        repo: &R,
        aggregate: &mut R::Aggregate,
    ) -> Result<(), DomainError> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or(DomainError::ScopeClosed)?;
        repo.remove(&mut state.tx, aggregate).await?;
        state.events.extend(aggregate.pull_events());
        Ok(())
    }
}

/// Runs business logic in a transaction and commits its events with it.
///
/// Each attempt begins a transaction, runs the caller's closure against a
/// [`UnitOfWorkScope`], writes the drained events to the outbox and commits.
/// Any failure rolls the attempt back; transient failures repeat the whole
/// attempt under the retry policy, so the closure must be safe to re-run.
pub struct UnitOfWork<S> {
    store: S,
    config: UnitOfWorkConfig,
    retry: RetryPolicy,
}

impl<S: Store> UnitOfWork<S> {
    /// Creates a unit of work with the default configuration.
    pub fn new(store: S) -> Self {
        Self::with_config(store, UnitOfWorkConfig::default())
    }

    pub fn with_config(store: S, config: UnitOfWorkConfig) -> Self {
        let retry = RetryPolicy::new(config.retry.clone());
        Self {
            store,
            config,
            retry,
        }
    }

    /// Returns a reference to the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Runs `work` atomically, retrying transient failures.
    ///
    /// `work` is called once per attempt with a fresh scope. Its future is
    /// polled only after the attempt's transaction has begun.
    #[tracing::instrument(skip_all)]
    pub async fn execute<R, F, Fut>(&self, ctx: &ExecContext, mut work: F) -> Result<R, DomainError>
    where
        F: FnMut(UnitOfWorkScope<S::Tx>) -> Fut + Send,
        Fut: Future<Output = Result<R, DomainError>> + Send,
        R: Send,
    {
        let start = std::time::Instant::now();

        let result = self
            .retry
            .execute_with_retry(ctx, |attempt| {
                let scope = UnitOfWorkScope::pending();
                let future = work(scope.clone());
                self.attempt(ctx, attempt, scope, future)
            })
            .await;

        metrics::histogram!("uow_execute_duration_seconds").record(start.elapsed().as_secs_f64());
        result
    }

    /// Runs `work` atomically, exactly once.
    #[tracing::instrument(skip_all)]
    pub async fn execute_once<R, F, Fut>(&self, ctx: &ExecContext, work: F) -> Result<R, DomainError>
    where
        F: FnOnce(UnitOfWorkScope<S::Tx>) -> Fut + Send,
        Fut: Future<Output = Result<R, DomainError>> + Send,
        R: Send,
    {
        let scope = UnitOfWorkScope::pending();
        let future = work(scope.clone());
        self.attempt(ctx, 1, scope, future).await
    }

    fn bounded(&self, ctx: &ExecContext) -> ExecContext {
        match ctx.deadline() {
            Some(_) => ctx.clone(),
            None => ctx.clone().with_timeout(self.config.default_timeout),
        }
    }

    async fn attempt<R, Fut>(
        &self,
        ctx: &ExecContext,
        attempt: u32,
        scope: UnitOfWorkScope<S::Tx>,
        work: Fut,
    ) -> Result<R, DomainError>
    where
        Fut: Future<Output = Result<R, DomainError>>,
    {
        let ctx = self.bounded(ctx);
        let outcome = ctx
            .run(async {
                let tx = self.store.begin().await?;
                scope.open(tx).await;

                let value = match work.await {
                    Ok(value) => value,
                    Err(err) => {
                        if let Some(state) = scope.close().await {
                            rollback(state.tx).await;
                        }
                        return Err(err);
                    }
                };

                let Some(ScopeState { mut tx, events }) = scope.close().await else {
                    return Err(DomainError::ScopeClosed);
                };

                for event in &events {
                    if let Err(err) = tx.save_event(event).await {
                        rollback(tx).await;
                        return Err(err.into());
                    }
                }
                tx.commit().await?;

                Ok((value, events.len()))
            })
            .await;

        // A timed-out attempt leaves the transaction in the scope; dropping it rolls back.
        drop(scope.close().await);

        match outcome {
            Ok((value, events)) => {
                metrics::counter!("uow_commits_total").increment(1);
                tracing::debug!(attempt, events, "unit of work committed");
                Ok(value)
            }
            Err(err) => {
                tracing::debug!(attempt, error = %err, "unit of work rolled back");
                Err(err)
            }
        }
    }
}

async fn rollback<T: Transaction>(tx: T) {
    if let Err(err) = tx.rollback().await {
        tracing::warn!(error = %err, "rollback failed");
    }
}
