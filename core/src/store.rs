//! Durable store abstraction.
//!
//! The durable store is a transactional relational store holding two tables:
//! `orders` and `outbox`. The engine needs exactly two capabilities from it:
//!
//! - atomic multi-statement transactions
//! - a row-locking scan that *skips* rows already locked by another transaction
//!
//! The second one is what lets several relay workers drain the outbox
//! concurrently: each locker gets a disjoint set of rows. A store without
//! `SKIP LOCKED` must emulate it (for example with a compare-and-set
//! `claimed_by` column) with the same disjointness guarantee.
//!
//! # Transaction lifetime
//!
//! A [`StoreTransaction`] that is dropped without [`StoreTransaction::commit`]
//! rolls back. Cancelling a caller's future is therefore a rollback, never a
//! partial write.
//!
//! # Implementations
//!
//! - `PostgresStore` (in `outbox-postgres`): `FOR UPDATE SKIP LOCKED`
//! - `InMemoryStore` (in `outbox-testing`): same semantics, with failure injection

use crate::order::{Order, OrderId, OutboxId};
use crate::outbox::OutboxRecord;
use std::future::Future;
use thiserror::Error;

/// Errors that can occur during durable store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store cannot be reached (connection refused, pool exhausted, ...)
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The operation exceeded its deadline
    #[error("Store operation timed out")]
    Timeout,

    /// A statement failed
    #[error("Query failed: {0}")]
    Query(String),

    /// A uniqueness constraint rejected the write
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A stored row could not be decoded
    #[error("Decode failed: {0}")]
    Decode(String),
}

impl StoreError {
    /// Whether the failure is transient (connectivity or deadline).
    ///
    /// Transient failures are retried by the existing timer or by the client;
    /// they are never fatal after startup.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout)
    }
}

/// A transactional store holding `orders` and `outbox`.
///
/// Implementations must be cheap to share (`Send + Sync`); each call to
/// [`DurableStore::begin`] opens an independent transaction.
pub trait DurableStore: Send + Sync {
    /// Transaction handle produced by [`DurableStore::begin`].
    type Transaction: StoreTransaction;

    /// Open a new transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if no connection can be obtained.
    fn begin(&self) -> impl Future<Output = Result<Self::Transaction, StoreError>> + Send;

    /// Read a committed order directly from the store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    fn find_order(
        &self,
        id: OrderId,
    ) -> impl Future<Output = Result<Option<Order>, StoreError>> + Send;
}

/// One open store transaction.
///
/// Writes become visible to other transactions only on [`commit`](Self::commit).
/// Dropping the handle without committing discards every write and releases
/// every row lock it holds.
pub trait StoreTransaction: Send {
    /// Insert a business record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] on a duplicate id, or another
    /// [`StoreError`] if the statement fails.
    fn insert_order(&mut self, order: &Order)
    -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Insert an outbox record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the statement fails.
    fn insert_outbox(
        &mut self,
        record: &OutboxRecord,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Lock and return up to `limit` pending records, oldest first.
    ///
    /// Rows already locked by a concurrent transaction are skipped, not waited
    /// on. The locks are held until this transaction ends.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the scan fails.
    fn lock_pending(
        &mut self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<OutboxRecord>, StoreError>> + Send;

    /// Mark a locked record as processed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the update fails.
    fn mark_processed(&mut self, id: OutboxId)
    -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Commit every write of this transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the commit fails; nothing is then visible.
    fn commit(self) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Discard every write of this transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store reports a rollback failure. The
    /// transaction is discarded either way.
    fn rollback(self) -> impl Future<Output = Result<(), StoreError>> + Send;
}
