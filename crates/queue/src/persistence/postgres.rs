//! PostgreSQL implementation of QueueStore and LeaseStore
//!
//! Production-ready persistence using PostgreSQL with:
//! - Lease acquisition as a single conditional UPDATE (no row locks held
//!   across the handler call)
//! - Lease expiry evaluated against the database clock, never worker clocks
//! - Every status write guarded against terminal entries

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::entry::*;
use super::store::*;
use crate::config::QueueConfig;
use crate::lease::LeaseStore;
use crate::reliability::ErrorCode;

const ENTRY_COLUMNS: &str = "id, entity_type, source_entity_id, operation_type, payload, \
     status, attempt_count, max_retry_attempts, locked_by, lock_expires_at, next_retry_at, \
     error_code, error_message, target_entity_id, result, created_at, updated_at";

const NOT_TERMINAL: &str = "status NOT IN ('COMPLETED', 'DEAD_LETTERED')";

/// PostgreSQL implementation of QueueStore
///
/// Uses a connection pool for efficient database access. Apply the schema
/// with [`PostgresQueueStore::migrate`] before first use.
///
/// # Example
///
/// ```ignore
/// use reconcile_queue::{PostgresQueueStore, QueueConfig};
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let store = PostgresQueueStore::from_config(pool, &QueueConfig::from_env());
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresQueueStore {
    pool: PgPool,
    default_max_attempts: u32,
}

impl PostgresQueueStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            default_max_attempts: 3,
        }
    }

    /// Create a store whose attempt ceiling comes from `config`
    pub fn from_config(pool: PgPool, config: &QueueConfig) -> Self {
        Self::new(pool).with_default_max_attempts(config.max_retry_attempts)
    }

    /// Set the attempt ceiling for entries enqueued without an override
    pub fn with_default_max_attempts(mut self, max: u32) -> Self {
        self.default_max_attempts = max.max(1);
        self
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                StoreError::Database(e.to_string())
            })
    }

    async fn fetch_entries(&self, sql: &str, limit: usize) -> Result<Vec<QueueEntry>, StoreError> {
        let rows = sqlx::query(sql)
            .bind(limit.min(i64::MAX as usize) as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("fetch entries", e))?;

        rows.iter().map(row_to_entry).collect()
    }

    /// Work out why a guarded UPDATE touched no row
    async fn rejection(&self, id: Uuid, worker_id: Option<&str>) -> StoreError {
        match self.get_by_id(id).await {
            Ok(None) => StoreError::EntryNotFound(id),
            Ok(Some(entry)) if entry.status.is_terminal() => StoreError::InvalidTransition {
                entry_id: id,
                status: entry.status,
            },
            Ok(Some(entry)) => match worker_id {
                Some(worker_id) => StoreError::LeaseNotHeld {
                    entry_id: id,
                    worker_id: worker_id.to_string(),
                },
                None => StoreError::InvalidTransition {
                    entry_id: id,
                    status: entry.status,
                },
            },
            Err(e) => e,
        }
    }
}

#[async_trait]
impl QueueStore for PostgresQueueStore {
    #[instrument(skip(self, entry), fields(entity_type = %entry.entity_type))]
    async fn enqueue(&self, entry: NewQueueEntry) -> Result<QueueEntry, StoreError> {
        let id = Uuid::now_v7();
        let max_attempts = entry
            .max_retry_attempts
            .unwrap_or(self.default_max_attempts)
            .max(1);

        let sql = format!(
            r#"
            INSERT INTO sync_queue (
                id, entity_type, source_entity_id, operation_type, payload, max_retry_attempts
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {ENTRY_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(id)
            .bind(&entry.entity_type)
            .bind(&entry.source_entity_id)
            .bind(entry.operation_type.as_str())
            .bind(&entry.payload)
            .bind(max_attempts as i32)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| db_error("enqueue entry", e))?;

        debug!(entry_id = %id, "enqueued entry");
        row_to_entry(&row)
    }

    #[instrument(skip(self))]
    async fn get_pending(&self, limit: usize) -> Result<Vec<QueueEntry>, StoreError> {
        let sql = format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM sync_queue
            WHERE status IN ('PENDING', 'PROCESSING')
              AND (locked_by IS NULL OR lock_expires_at < NOW())
            ORDER BY created_at, id
            LIMIT $1
            "#
        );
        self.fetch_entries(&sql, limit).await
    }

    #[instrument(skip(self))]
    async fn get_retry_ready(&self, limit: usize) -> Result<Vec<QueueEntry>, StoreError> {
        let sql = format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM sync_queue
            WHERE status = 'FAILED_RETRYABLE'
              AND (next_retry_at IS NULL OR next_retry_at <= NOW())
              AND (locked_by IS NULL OR lock_expires_at < NOW())
            ORDER BY next_retry_at NULLS FIRST, created_at
            LIMIT $1
            "#
        );
        self.fetch_entries(&sql, limit).await
    }

    #[instrument(skip(self))]
    async fn get_by_id(&self, id: Uuid) -> Result<Option<QueueEntry>, StoreError> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM sync_queue WHERE id = $1");

        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("get entry", e))?;

        row.as_ref().map(row_to_entry).transpose()
    }

    #[instrument(skip(self))]
    async fn mark_processing(&self, id: Uuid, worker_id: &str) -> Result<(), StoreError> {
        let sql = format!(
            r#"
            UPDATE sync_queue
            SET status = 'PROCESSING',
                next_retry_at = NULL,
                updated_at = NOW()
            WHERE id = $1
              AND locked_by = $2
              AND lock_expires_at >= NOW()
              AND {NOT_TERMINAL}
            RETURNING id
            "#
        );

        let updated = sqlx::query(&sql)
            .bind(id)
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("mark processing", e))?;

        match updated {
            Some(_) => Ok(()),
            None => Err(self.rejection(id, Some(worker_id)).await),
        }
    }

    #[instrument(skip(self, result))]
    async fn mark_completed(
        &self,
        id: Uuid,
        target_entity_id: &str,
        result: serde_json::Value,
    ) -> Result<(), StoreError> {
        let sql = format!(
            r#"
            UPDATE sync_queue
            SET status = 'COMPLETED',
                target_entity_id = $2,
                result = $3,
                next_retry_at = NULL,
                locked_by = NULL,
                lock_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND {NOT_TERMINAL}
            RETURNING id
            "#
        );

        let updated = sqlx::query(&sql)
            .bind(id)
            .bind(target_entity_id)
            .bind(&result)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("mark completed", e))?;

        match updated {
            Some(_) => {
                debug!(entry_id = %id, "completed entry");
                Ok(())
            }
            None => Err(self.rejection(id, None).await),
        }
    }

    #[instrument(skip(self, failure), fields(error_code = %failure.error_code))]
    async fn mark_failed(
        &self,
        id: Uuid,
        failure: &EntryFailure,
    ) -> Result<QueueStatus, StoreError> {
        // Dead-lettering also drops the lease so the terminal row never
        // needs another write.
        let sql = format!(
            r#"
            UPDATE sync_queue
            SET attempt_count = attempt_count + 1,
                error_code = $2,
                error_message = $3,
                status = CASE WHEN $4::boolean THEN 'FAILED_RETRYABLE' ELSE 'DEAD_LETTERED' END,
                next_retry_at = CASE WHEN $4::boolean
                                     THEN NOW() + make_interval(secs => $5)
                                     ELSE NULL END,
                locked_by = CASE WHEN $4::boolean THEN locked_by ELSE NULL END,
                lock_expires_at = CASE WHEN $4::boolean THEN lock_expires_at ELSE NULL END,
                updated_at = NOW()
            WHERE id = $1 AND {NOT_TERMINAL}
            RETURNING status
            "#
        );

        let row = sqlx::query(&sql)
            .bind(id)
            .bind(failure.error_code.as_str())
            .bind(&failure.error_message)
            .bind(failure.should_retry)
            .bind(failure.retry_delay.min(MAX_STORED_DELAY).as_secs_f64())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("mark failed", e))?;

        match row {
            Some(row) => {
                let status: String = row.get("status");
                let status = status.parse()?;
                debug!(entry_id = %id, %status, "recorded failed attempt");
                Ok(status)
            }
            None => Err(self.rejection(id, None).await),
        }
    }

    #[instrument(skip(self))]
    async fn list_dead_lettered(&self, limit: usize) -> Result<Vec<QueueEntry>, StoreError> {
        let sql = format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM sync_queue
            WHERE status = 'DEAD_LETTERED'
            ORDER BY updated_at DESC
            LIMIT $1
            "#
        );
        self.fetch_entries(&sql, limit).await
    }

    #[instrument(skip(self))]
    async fn requeue_dead_lettered(&self, id: Uuid) -> Result<QueueEntry, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO sync_queue (
                id, entity_type, source_entity_id, operation_type, payload, max_retry_attempts
            )
            SELECT $1, entity_type, source_entity_id, operation_type, payload, max_retry_attempts
            FROM sync_queue
            WHERE id = $2 AND status = 'DEAD_LETTERED'
            RETURNING {ENTRY_COLUMNS}
            "#
        );

        let new_id = Uuid::now_v7();
        let row = sqlx::query(&sql)
            .bind(new_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("requeue dead letter", e))?;

        match row {
            Some(row) => {
                debug!(original_id = %id, entry_id = %new_id, "requeued dead-lettered entry");
                row_to_entry(&row)
            }
            None => Err(self.rejection(id, None).await),
        }
    }

    #[instrument(skip(self))]
    async fn depth(&self) -> Result<QueueDepth, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM sync_queue GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("queue depth", e))?;

        let mut depth = QueueDepth::default();
        for row in rows {
            let status: String = row.get("status");
            let count: i64 = row.get("count");
            depth.record(status.parse()?, count.max(0) as u64);
        }
        Ok(depth)
    }
}

#[async_trait]
impl LeaseStore for PostgresQueueStore {
    #[instrument(skip(self))]
    async fn acquire(
        &self,
        entry_id: Uuid,
        worker_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let sql = format!(
            r#"
            UPDATE sync_queue
            SET locked_by = $2,
                lock_expires_at = NOW() + make_interval(secs => $3),
                updated_at = NOW()
            WHERE id = $1
              AND {NOT_TERMINAL}
              AND (locked_by IS NULL OR lock_expires_at < NOW())
            RETURNING id
            "#
        );

        let acquired = sqlx::query(&sql)
            .bind(entry_id)
            .bind(worker_id)
            .bind(ttl.min(MAX_STORED_DELAY).as_secs_f64())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("acquire lease", e))?;

        Ok(acquired.is_some())
    }

    #[instrument(skip(self))]
    async fn release(&self, entry_id: Uuid, worker_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE sync_queue
            SET locked_by = NULL,
                lock_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND locked_by = $2
            "#,
        )
        .bind(entry_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("release lease", e))?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn reap(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_queue
            SET locked_by = NULL,
                lock_expires_at = NULL,
                updated_at = NOW()
            WHERE locked_by IS NOT NULL
              AND lock_expires_at < NOW()
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("reap leases", e))?;

        let reaped = result.rows_affected();
        if reaped > 0 {
            debug!(count = reaped, "reaped expired leases");
        }
        Ok(reaped)
    }
}

// Helper functions

fn db_error(operation: &str, e: sqlx::Error) -> StoreError {
    error!("Failed to {}: {}", operation, e);
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(e.to_string())
        }
        _ => StoreError::Database(e.to_string()),
    }
}

fn row_to_entry(row: &PgRow) -> Result<QueueEntry, StoreError> {
    let operation: String = row.get("operation_type");
    let status: String = row.get("status");
    let error_code: Option<String> = row.get("error_code");

    Ok(QueueEntry {
        id: row.get("id"),
        entity_type: row.get("entity_type"),
        source_entity_id: row.get("source_entity_id"),
        operation_type: operation.parse()?,
        payload: row.get("payload"),
        status: status.parse()?,
        attempt_count: row.get::<i32, _>("attempt_count").max(0) as u32,
        max_retry_attempts: row.get::<i32, _>("max_retry_attempts").max(0) as u32,
        lease: Lease::from_columns(row.get("locked_by"), row.get("lock_expires_at")),
        next_retry_at: row.get("next_retry_at"),
        error_code: error_code.map(|c| c.parse().unwrap_or(ErrorCode::Unknown)),
        error_message: row.get("error_message"),
        target_entity_id: row.get("target_entity_id"),
        result: row.get("result"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
