//! `PostgreSQL` durable store for the outbox engine.
//!
//! [`PostgresStore`] implements `DurableStore` over a `sqlx` connection pool.
//! Orders and outbox rows are written in one database transaction, and the
//! relay claims pending rows with `FOR UPDATE SKIP LOCKED`, so any number of
//! relay workers (in any number of processes) drain the outbox without
//! claiming the same row twice.
//!
//! # Schema
//!
//! `migrations/0001_orders_outbox.sql`, applied by [`PostgresStore::apply_schema`]:
//!
//! | table    | columns                                                    |
//! |----------|------------------------------------------------------------|
//! | `orders` | `id`, `user_id`, `amount`, `created_at`                    |
//! | `outbox` | `id`, `event_type`, `payload`, `status`, `created_at`      |
//!
//! # Example
//!
//! ```ignore
//! use outbox_postgres::{PoolConfig, PostgresStore};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresStore::connect("postgres://localhost/outbox_db", &PoolConfig::default()).await?;
//!     store.apply_schema().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use outbox_core::order::{Order, OrderId, OutboxId, UserId};
use outbox_core::outbox::{OutboxRecord, OutboxStatus};
use outbox_core::store::{DurableStore, StoreError, StoreTransaction};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};
use std::time::Duration;
use uuid::Uuid;

const SCHEMA: &str = include_str!("../migrations/0001_orders_outbox.sql");

/// Connection pool settings.
///
/// # Default Values
///
/// - `max_connections`: 25
/// - `min_connections`: 5
/// - `max_lifetime`: 5 minutes
/// - `acquire_timeout`: 5 seconds
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on open connections
    pub max_connections: u32,
    /// Connections kept open while idle
    pub min_connections: u32,
    /// Connections are recycled after this long
    pub max_lifetime: Duration,
    /// Deadline for obtaining a connection
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 25,
            min_connections: 5,
            max_lifetime: Duration::from_secs(300),
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// Map a `sqlx` error onto the store taxonomy.
fn map_sqlx(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::PoolTimedOut => StoreError::Timeout,
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Protocol(_) => StoreError::Unavailable(e.to_string()),
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Conflict(db.message().to_string())
        }
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::ColumnNotFound(_) => StoreError::Decode(e.to_string()),
        _ => StoreError::Query(e.to_string()),
    }
}

#[derive(FromRow)]
struct OrderRow {
    id: Uuid,
    user_id: Uuid,
    amount: i64,
}

impl From<OrderRow> for Order {
    fn from(row: OrderRow) -> Self {
        Self {
            id: OrderId::from_uuid(row.id),
            user_id: UserId::from_uuid(row.user_id),
            amount: row.amount,
        }
    }
}

#[derive(FromRow)]
struct OutboxRow {
    id: Uuid,
    event_type: String,
    payload: Vec<u8>,
    status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<OutboxRow> for OutboxRecord {
    type Error = StoreError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        let status =
            OutboxStatus::parse(&row.status).map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(Self {
            id: OutboxId::from_uuid(row.id),
            event_type: row.event_type,
            payload: row.payload,
            status,
            created_at: row.created_at,
        })
    }
}

fn to_records(rows: Vec<OutboxRow>) -> Result<Vec<OutboxRecord>, StoreError> {
    rows.into_iter().map(OutboxRecord::try_from).collect()
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// `PostgreSQL`-backed durable store.
///
/// Cheap to clone; clones share the pool.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect a pool to `database_url` and verify it with a round trip.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the database cannot be reached.
    pub async fn connect(database_url: &str, config: &PoolConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .max_lifetime(config.max_lifetime)
            .acquire_timeout(config.acquire_timeout)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        tracing::info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connected to PostgreSQL"
        );
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `orders` and `outbox` tables if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the DDL fails.
    pub async fn apply_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        tracing::info!("Schema applied");
        Ok(())
    }

    /// Committed outbox rows, oldest first, at most `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails or a row cannot be decoded.
    pub async fn list_outbox(&self, limit: usize) -> Result<Vec<OutboxRecord>, StoreError> {
        let rows: Vec<OutboxRow> = sqlx::query_as(
            r"
            SELECT id, event_type, payload, status, created_at
            FROM outbox
            ORDER BY created_at ASC
            LIMIT $1
            ",
        )
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        to_records(rows)
    }

    /// Number of committed outbox rows with `status`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub async fn count_outbox(&self, status: OutboxStatus) -> Result<u64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM outbox WHERE status = $1")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;

        Ok(u64::try_from(count).unwrap_or_default())
    }
}

impl DurableStore for PostgresStore {
    type Transaction = PgTransaction;

    async fn begin(&self) -> Result<PgTransaction, StoreError> {
        let tx = self.pool.begin().await.map_err(map_sqlx)?;
        Ok(PgTransaction { tx })
    }

    async fn find_order(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        let row: Option<OrderRow> =
            sqlx::query_as("SELECT id, user_id, amount FROM orders WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx)?;

        Ok(row.map(Order::from))
    }
}

/// An open `PostgreSQL` transaction. Rolls back when dropped uncommitted.
pub struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

impl std::fmt::Debug for PgTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgTransaction").finish_non_exhaustive()
    }
}

impl StoreTransaction for PgTransaction {
    async fn insert_order(&mut self, order: &Order) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO orders (id, user_id, amount) VALUES ($1, $2, $3)")
            .bind(order.id.as_uuid())
            .bind(order.user_id.as_uuid())
            .bind(order.amount)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn insert_outbox(&mut self, record: &OutboxRecord) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO outbox (id, event_type, payload, status, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ",
        )
        .bind(record.id.as_uuid())
        .bind(&record.event_type)
        .bind(&record.payload)
        .bind(record.status.as_str())
        .bind(record.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn lock_pending(&mut self, limit: usize) -> Result<Vec<OutboxRecord>, StoreError> {
        let rows: Vec<OutboxRow> = sqlx::query_as(
            r"
            SELECT id, event_type, payload, status, created_at
            FROM outbox
            WHERE status = 'PENDING'
            ORDER BY created_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            ",
        )
        .bind(sql_limit(limit))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;

        to_records(rows)
    }

    async fn mark_processed(&mut self, id: OutboxId) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE outbox SET status = 'PROCESSED' WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Query(format!("outbox record {id} not found")));
        }
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(map_sqlx)
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await.map_err(map_sqlx)
    }
}
