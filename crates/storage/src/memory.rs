use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    AggregateId, AggregateRow, Clock, DomainEvent, OutboxRecord, OutboxStats, OutboxStatus,
    OutboxStore, Result, StorageError, Store, SystemClock, Transaction, Version,
};

/// A storage failure the in-memory store can be told to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Deadlock,
    LockTimeout,
    ConnectionLost,
    Duplicate,
}

impl Fault {
    fn into_error(self, operation: &str) -> StorageError {
        let message = format!("injected fault during {operation}");
        match self {
            Fault::Deadlock => StorageError::Deadlock(message),
            Fault::LockTimeout => StorageError::LockTimeout(message),
            Fault::ConnectionLost => StorageError::ConnectionLost(message),
            Fault::Duplicate => StorageError::Duplicate(message),
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    commit: VecDeque<Fault>,
    save_event: VecDeque<Fault>,
}

type RowKey = (String, AggregateId);

#[derive(Debug, Default)]
struct MemoryState {
    aggregates: HashMap<RowKey, AggregateRow>,
    outbox: Vec<OutboxRecord>,
}

/// In-memory storage backend for tests and local runs.
///
/// Transactions never hold the store lock across calls. Writes are staged in
/// the transaction together with the version they were based on, and commit
/// re-validates those versions before applying everything at once. A writer
/// that lost a race therefore fails with
/// [`StorageError::ConcurrentModification`] either at save time or at commit.
#[derive(Clone)]
pub struct InMemoryStore {
    state: Arc<RwLock<MemoryState>>,
    faults: Arc<Mutex<Faults>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl InMemoryStore {
    /// Creates a new empty store using the system clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new empty store that stamps records with `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(RwLock::new(MemoryState::default())),
            faults: Arc::new(Mutex::new(Faults::default())),
            clock,
        }
    }

    /// Makes the next commit fail with `fault` instead of applying.
    pub fn fail_next_commit(&self, fault: Fault) {
        self.lock_faults().commit.push_back(fault);
    }

    /// Makes the next outbox insert fail with `fault`.
    pub fn fail_next_save_event(&self, fault: Fault) {
        self.lock_faults().save_event.push_back(fault);
    }

    /// Returns the committed row for an aggregate.
    pub async fn aggregate(
        &self,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Option<AggregateRow> {
        let state = self.state.read().await;
        state
            .aggregates
            .get(&(aggregate_type.to_string(), aggregate_id))
            .cloned()
    }

    /// Returns the number of committed aggregate rows.
    pub async fn aggregate_count(&self) -> usize {
        self.state.read().await.aggregates.len()
    }

    /// Returns every committed outbox record in insertion order.
    pub async fn outbox_records(&self) -> Vec<OutboxRecord> {
        self.state.read().await.outbox.clone()
    }

    fn lock_faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_commit_fault(&self) -> Option<Fault> {
        self.lock_faults().commit.pop_front()
    }

    fn take_save_event_fault(&self) -> Option<Fault> {
        self.lock_faults().save_event.pop_front()
    }

    /// Applies a status change to one record if the state machine allows it.
    ///
    /// `apply` works on a copy and returns the target status; the copy replaces
    /// the stored record only when `current -> target` is a valid transition.
    async fn transition<F>(&self, id: Uuid, apply: F) -> Result<Option<OutboxStatus>>
    where
        F: FnOnce(&mut OutboxRecord) -> OutboxStatus + Send,
    {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        let Some(record) = state.outbox.iter_mut().find(|r| r.id == id) else {
            return Ok(None);
        };

        let mut next = record.clone();
        let target = apply(&mut next);
        if !record.status.can_transition_to(target) {
            return Ok(None);
        }
        next.status = target;
        next.updated_at = now;
        *record = next;
        Ok(Some(target))
    }
}

#[async_trait]
impl Store for InMemoryStore {
    type Tx = InMemoryTransaction;

    async fn begin(&self) -> Result<InMemoryTransaction> {
        Ok(InMemoryTransaction {
            store: self.clone(),
            staged: HashMap::new(),
            events: Vec::new(),
        })
    }
}

/// A staged aggregate write. `base` is the committed version the write was
/// computed from (`None` when the row did not exist).
#[derive(Debug)]
struct StagedRow {
    base: Option<Version>,
    row: Option<AggregateRow>,
}

/// Transaction over an [`InMemoryStore`].
pub struct InMemoryTransaction {
    store: InMemoryStore,
    staged: HashMap<RowKey, StagedRow>,
    events: Vec<OutboxRecord>,
}

impl InMemoryTransaction {
    async fn visible(&self, key: &RowKey) -> Option<AggregateRow> {
        if let Some(staged) = self.staged.get(key) {
            return staged.row.clone();
        }
        self.store.state.read().await.aggregates.get(key).cloned()
    }

    async fn committed_version(&self, key: &RowKey) -> Option<Version> {
        self.store
            .state
            .read()
            .await
            .aggregates
            .get(key)
            .map(|row| row.version)
    }

    async fn stage(&mut self, key: RowKey, row: Option<AggregateRow>) {
        let base = match self.staged.get(&key) {
            Some(existing) => existing.base,
            None => self.committed_version(&key).await,
        };
        self.staged.insert(key, StagedRow { base, row });
    }
}

#[async_trait]
impl Transaction for InMemoryTransaction {
    async fn load_aggregate(
        &mut self,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<Option<AggregateRow>> {
        Ok(self
            .visible(&(aggregate_type.to_string(), aggregate_id))
            .await)
    }

    async fn aggregate_exists(
        &mut self,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<bool> {
        Ok(self
            .visible(&(aggregate_type.to_string(), aggregate_id))
            .await
            .is_some())
    }

    async fn insert_aggregate(
        &mut self,
        aggregate_type: &str,
        aggregate_id: AggregateId,
        state: &serde_json::Value,
    ) -> Result<()> {
        let key = (aggregate_type.to_string(), aggregate_id);
        if self.visible(&key).await.is_some() {
            return Err(StorageError::Duplicate(format!(
                "{aggregate_type} {aggregate_id} already exists"
            )));
        }

        let now = self.store.clock.now();
        let row = AggregateRow {
            aggregate_type: aggregate_type.to_string(),
            aggregate_id,
            version: Version::first(),
            state: state.clone(),
            created_at: now,
            updated_at: now,
        };
        self.stage(key, Some(row)).await;
        Ok(())
    }

    async fn update_aggregate(
        &mut self,
        aggregate_type: &str,
        aggregate_id: AggregateId,
        expected: Version,
        state: &serde_json::Value,
    ) -> Result<u64> {
        let key = (aggregate_type.to_string(), aggregate_id);
        let Some(current) = self.visible(&key).await else {
            return Ok(0);
        };
        if current.version != expected {
            return Ok(0);
        }

        let row = AggregateRow {
            version: expected.next(),
            state: state.clone(),
            updated_at: self.store.clock.now(),
            ..current
        };
        self.stage(key, Some(row)).await;
        Ok(1)
    }

    async fn delete_aggregate(
        &mut self,
        aggregate_type: &str,
        aggregate_id: AggregateId,
        expected: Version,
    ) -> Result<u64> {
        let key = (aggregate_type.to_string(), aggregate_id);
        match self.visible(&key).await {
            Some(current) if current.version == expected => {
                self.stage(key, None).await;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn save_event(&mut self, event: &DomainEvent) -> Result<()> {
        if let Some(fault) = self.store.take_save_event_fault() {
            return Err(fault.into_error("save_event"));
        }

        let id = event.event_id().as_uuid();
        let already_committed = self
            .store
            .state
            .read()
            .await
            .outbox
            .iter()
            .any(|r| r.id == id);
        if already_committed || self.events.iter().any(|r| r.id == id) {
            return Err(StorageError::Duplicate(format!("outbox record {id}")));
        }

        self.events
            .push(OutboxRecord::from_event(event, self.store.clock.now()));
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        if let Some(fault) = self.store.take_commit_fault() {
            return Err(fault.into_error("commit"));
        }

        let mut state = self.store.state.write().await;

        for (key, staged) in &self.staged {
            let committed = state.aggregates.get(key).map(|row| row.version);
            if committed != staged.base {
                let (aggregate_type, aggregate_id) = key.clone();
                return Err(match staged.base {
                    Some(expected) => StorageError::ConcurrentModification {
                        aggregate_type,
                        aggregate_id,
                        expected,
                    },
                    None => StorageError::Duplicate(format!(
                        "{aggregate_type} {aggregate_id} already exists"
                    )),
                });
            }
        }
        for record in &self.events {
            if state.outbox.iter().any(|r| r.id == record.id) {
                return Err(StorageError::Duplicate(format!(
                    "outbox record {}",
                    record.id
                )));
            }
        }

        for (key, staged) in self.staged {
            match staged.row {
                Some(row) => {
                    state.aggregates.insert(key, row);
                }
                None => {
                    state.aggregates.remove(&key);
                }
            }
        }
        state.outbox.extend(self.events);
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    async fn get_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let state = self.state.read().await;
        let mut pending: Vec<_> = state
            .outbox
            .iter()
            .filter(|r| r.status == OutboxStatus::Pending)
            .cloned()
            .collect();
        // Stable sort keeps insertion order among equal timestamps.
        pending.sort_by_key(|r| r.created_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn claim(&self, id: Uuid) -> Result<bool> {
        let claimed = self
            .transition(id, |_| OutboxStatus::Processing)
            .await?;
        Ok(claimed.is_some())
    }

    async fn mark_published(&self, id: Uuid) -> Result<()> {
        self.transition(id, |_| OutboxStatus::Published)
            .await?
            .map(|_| ())
            .ok_or(StorageError::OutboxTransition {
                record_id: id,
                expected: OutboxStatus::Processing,
            })
    }

    async fn mark_failed(&self, id: Uuid, max_retries: i32, error: &str) -> Result<OutboxStatus> {
        let error = error.to_string();
        let updated = self
            .transition(id, move |record| {
                record.retry_count += 1;
                record.last_error = Some(error);
                if record.retry_count >= max_retries {
                    OutboxStatus::Failed
                } else {
                    OutboxStatus::Pending
                }
            })
            .await?;
        updated.ok_or(StorageError::OutboxTransition {
            record_id: id,
            expected: OutboxStatus::Processing,
        })
    }

    async fn requeue_stale(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        let mut moved = 0;
        for record in state.outbox.iter_mut().filter(|r| {
            r.status.can_transition_to(OutboxStatus::Pending) && r.updated_at < older_than
        }) {
            record.status = OutboxStatus::Pending;
            record.updated_at = now;
            moved += 1;
        }
        Ok(moved)
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxRecord>> {
        let state = self.state.read().await;
        Ok(state.outbox.iter().find(|r| r.id == id).cloned())
    }

    async fn stats(&self) -> Result<OutboxStats> {
        let state = self.state.read().await;
        let mut stats = OutboxStats::default();
        for record in &state.outbox {
            match record.status {
                OutboxStatus::Pending => {
                    stats.pending += 1;
                    stats.oldest_pending = Some(match stats.oldest_pending {
                        Some(oldest) => oldest.min(record.created_at),
                        None => record.created_at,
                    });
                }
                OutboxStatus::Processing => stats.processing += 1,
                OutboxStatus::Published => stats.published += 1,
                OutboxStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}
