use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    AggregateId, AggregateRow, Clock, DomainEvent, OutboxRecord, OutboxStats, OutboxStatus,
    OutboxStore, Result, StorageError, Store, SystemClock, Transaction, Version,
};

const OUTBOX_COLUMNS: &str = "id, aggregate_type, aggregate_id, event_type, payload, status, \
     retry_count, last_error, occurred_at, created_at, updated_at";

/// PostgreSQL-backed storage.
///
/// Aggregates live in the `aggregates` table keyed by `(aggregate_type, id)`;
/// events in `outbox`. See `migrations/` for the schema.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PostgresStore {
    /// Creates a new PostgreSQL store using the system clock.
    pub fn new(pool: PgPool) -> Self {
        Self::with_clock(pool, Arc::new(SystemClock))
    }

    /// Creates a new PostgreSQL store that stamps rows with `clock`.
    pub fn with_clock(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        tracing::info!("database migrations applied");
        Ok(())
    }

    fn row_to_record(row: PgRow) -> Result<OutboxRecord> {
        let status: String = row.try_get("status")?;

        Ok(OutboxRecord {
            id: row.try_get("id")?,
            aggregate_id: AggregateId::from_uuid(row.try_get::<Uuid, _>("aggregate_id")?),
            aggregate_type: row.try_get("aggregate_type")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            status: status.parse()?,
            retry_count: row.try_get("retry_count")?,
            last_error: row.try_get("last_error")?,
            occurred_at: row.try_get("occurred_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl Store for PostgresStore {
    type Tx = PostgresTransaction;

    async fn begin(&self) -> Result<PostgresTransaction> {
        Ok(PostgresTransaction {
            tx: self.pool.begin().await?,
            clock: Arc::clone(&self.clock),
        })
    }
}

/// Transaction over a [`PostgresStore`].
pub struct PostgresTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
    clock: Arc<dyn Clock>,
}

#[async_trait]
impl Transaction for PostgresTransaction {
    async fn load_aggregate(
        &mut self,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<Option<AggregateRow>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT aggregate_type, id, version, state, created_at, updated_at
            FROM aggregates
            WHERE aggregate_type = $1 AND id = $2
            "#,
        )
        .bind(aggregate_type)
        .bind(aggregate_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await?;

        match row {
            Some(row) => Ok(Some(AggregateRow {
                aggregate_type: row.try_get("aggregate_type")?,
                aggregate_id: AggregateId::from_uuid(row.try_get::<Uuid, _>("id")?),
                version: Version::new(row.try_get("version")?),
                state: row.try_get("state")?,
                created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
                updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
            })),
            None => Ok(None),
        }
    }

    async fn aggregate_exists(
        &mut self,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM aggregates WHERE aggregate_type = $1 AND id = $2)",
        )
        .bind(aggregate_type)
        .bind(aggregate_id.as_uuid())
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(exists)
    }

    async fn insert_aggregate(
        &mut self,
        aggregate_type: &str,
        aggregate_id: AggregateId,
        state: &serde_json::Value,
    ) -> Result<()> {
        let now = self.clock.now();

        sqlx::query(
            r#"
            INSERT INTO aggregates (aggregate_type, id, version, state, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $5)
            "#,
        )
        .bind(aggregate_type)
        .bind(aggregate_id.as_uuid())
        .bind(Version::first().as_i64())
        .bind(state)
        .bind(now)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn update_aggregate(
        &mut self,
        aggregate_type: &str,
        aggregate_id: AggregateId,
        expected: Version,
        state: &serde_json::Value,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE aggregates
            SET version = $4, state = $5, updated_at = $6
            WHERE aggregate_type = $1 AND id = $2 AND version = $3
            "#,
        )
        .bind(aggregate_type)
        .bind(aggregate_id.as_uuid())
        .bind(expected.as_i64())
        .bind(expected.next().as_i64())
        .bind(state)
        .bind(self.clock.now())
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected())
    }

    async fn delete_aggregate(
        &mut self,
        aggregate_type: &str,
        aggregate_id: AggregateId,
        expected: Version,
    ) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM aggregates WHERE aggregate_type = $1 AND id = $2 AND version = $3",
        )
        .bind(aggregate_type)
        .bind(aggregate_id.as_uuid())
        .bind(expected.as_i64())
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected())
    }

    async fn save_event(&mut self, event: &DomainEvent) -> Result<()> {
        let record = OutboxRecord::from_event(event, self.clock.now());

        sqlx::query(
            r#"
            INSERT INTO outbox (
                id, aggregate_type, aggregate_id, event_type, payload, status,
                retry_count, last_error, occurred_at, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(record.id)
        .bind(&record.aggregate_type)
        .bind(record.aggregate_id.as_uuid())
        .bind(&record.event_type)
        .bind(&record.payload)
        .bind(record.status.as_str())
        .bind(record.retry_count)
        .bind(&record.last_error)
        .bind(record.occurred_at)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut *self.tx)
        .await?;

        tracing::debug!(event_id = %record.id, event_type = %record.event_type, "outbox record staged");
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PostgresStore {
    async fn get_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox WHERE status = $1 ORDER BY created_at ASC LIMIT $2"
        ))
        .bind(OutboxStatus::Pending.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_record).collect()
    }

    async fn claim(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE outbox SET status = $2, updated_at = $3 WHERE id = $1 AND status = $4",
        )
        .bind(id)
        .bind(OutboxStatus::Processing.as_str())
        .bind(self.clock.now())
        .bind(OutboxStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_published(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query(
            "UPDATE outbox SET status = $2, updated_at = $3 WHERE id = $1 AND status = $4",
        )
        .bind(id)
        .bind(OutboxStatus::Published.as_str())
        .bind(self.clock.now())
        .bind(OutboxStatus::Processing.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::OutboxTransition {
                record_id: id,
                expected: OutboxStatus::Processing,
            });
        }
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, max_retries: i32, error: &str) -> Result<OutboxStatus> {
        let status: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE outbox
            SET retry_count = retry_count + 1,
                last_error = $3,
                status = CASE WHEN retry_count + 1 >= $2 THEN 'FAILED' ELSE 'PENDING' END,
                updated_at = $4
            WHERE id = $1 AND status = 'PROCESSING'
            RETURNING status
            "#,
        )
        .bind(id)
        .bind(max_retries)
        .bind(error)
        .bind(self.clock.now())
        .fetch_optional(&self.pool)
        .await?;

        match status {
            Some(status) => status.parse(),
            None => Err(StorageError::OutboxTransition {
                record_id: id,
                expected: OutboxStatus::Processing,
            }),
        }
    }

    async fn requeue_stale(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE outbox SET status = $1, updated_at = $2 WHERE status = $3 AND updated_at < $4",
        )
        .bind(OutboxStatus::Pending.as_str())
        .bind(self.clock.now())
        .bind(OutboxStatus::Processing.as_str())
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxRecord>> {
        let row = sqlx::query(&format!("SELECT {OUTBOX_COLUMNS} FROM outbox WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_record).transpose()
    }

    async fn stats(&self) -> Result<OutboxStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'PENDING') AS pending,
                COUNT(*) FILTER (WHERE status = 'PROCESSING') AS processing,
                COUNT(*) FILTER (WHERE status = 'PUBLISHED') AS published,
                COUNT(*) FILTER (WHERE status = 'FAILED') AS failed,
                MIN(created_at) FILTER (WHERE status = 'PENDING') AS oldest_pending
            FROM outbox
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(OutboxStats {
            pending: row.try_get::<i64, _>("pending")? as u64,
            processing: row.try_get::<i64, _>("processing")? as u64,
            published: row.try_get::<i64, _>("published")? as u64,
            failed: row.try_get::<i64, _>("failed")? as u64,
            oldest_pending: row.try_get("oldest_pending")?,
        })
    }
}
