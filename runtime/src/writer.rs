//! Transactional writer.
//!
//! Persists an order and its `order.created` outbox record in one store
//! transaction. Either both rows become visible or neither does.

use crate::bounded;
use crate::metrics::OrderMetrics;
use outbox_core::environment::{Clock, SystemClock};
use outbox_core::error::{WriteError, WriteStage};
use outbox_core::order::Order;
use outbox_core::outbox::OutboxRecord;
use outbox_core::store::{DurableStore, StoreError, StoreTransaction};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Configuration of a [`TransactionalWriter`].
///
/// `write_timeout` bounds the whole begin-to-commit sequence; each store call
/// is additionally bounded by `operation_timeout`. The idempotency lock TTL
/// must exceed `write_timeout` or a slow write can lose its lock.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Deadline for each store call (begin, each insert, commit)
    pub operation_timeout: Duration,
    /// Deadline for the whole write
    pub write_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(10),
        }
    }
}

impl WriterConfig {
    /// Set the per-call deadline.
    #[must_use]
    pub const fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Set the deadline of the whole write.
    #[must_use]
    pub const fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }
}

/// Writes orders and their outbox events atomically.
#[derive(Clone)]
pub struct TransactionalWriter<D> {
    store: D,
    clock: Arc<dyn Clock>,
    config: WriterConfig,
}

impl<D> std::fmt::Debug for TransactionalWriter<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionalWriter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<D: DurableStore> TransactionalWriter<D> {
    /// Create a writer stamping outbox records with the system clock.
    #[must_use]
    pub fn new(store: D, config: WriterConfig) -> Self {
        Self::with_clock(store, Arc::new(SystemClock), config)
    }

    /// Create a writer with an explicit clock.
    #[must_use]
    pub fn with_clock(store: D, clock: Arc<dyn Clock>, config: WriterConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// The underlying store.
    #[must_use]
    pub const fn store(&self) -> &D {
        &self.store
    }

    /// Persist `order` and one pending `order.created` outbox record.
    ///
    /// Runs begin, insert order, encode payload, insert outbox record and
    /// commit in that order. Any failure rolls the transaction back, so no
    /// partial state is ever visible.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError`] naming the stage that failed. A commit that
    /// times out is reported as a failure even though the store may have
    /// committed; callers that retry rely on the idempotency guard.
    pub async fn create_order(&self, order: &Order) -> Result<(), WriteError> {
        let start = Instant::now();
        match self.write(order).await {
            Ok(()) => {
                OrderMetrics::record_created(start.elapsed());
                tracing::info!(
                    order_id = %order.id,
                    user_id = %order.user_id,
                    amount = order.amount,
                    "Order and outbox event committed"
                );
                Ok(())
            }
            Err(err) => {
                OrderMetrics::record_write_failure(err.stage());
                tracing::error!(
                    order_id = %order.id,
                    stage = %err.stage(),
                    error = %err,
                    "Order write failed"
                );
                Err(err)
            }
        }
    }

    async fn write(&self, order: &Order) -> Result<(), WriteError> {
        let deadline = Instant::now() + self.config.write_timeout;
        let mut tx = self
            .step(WriteStage::Begin, deadline, self.store.begin())
            .await?;

        if let Err(err) = self.fill(&mut tx, order, deadline).await {
            rollback(tx).await;
            return Err(err);
        }

        self.step(WriteStage::Commit, deadline, tx.commit()).await
    }

    async fn fill(
        &self,
        tx: &mut D::Transaction,
        order: &Order,
        deadline: Instant,
    ) -> Result<(), WriteError> {
        self.step(WriteStage::InsertOrder, deadline, tx.insert_order(order))
            .await?;
        let record = OutboxRecord::order_created(order, self.clock.now())?;
        self.step(WriteStage::InsertOutbox, deadline, tx.insert_outbox(&record))
            .await
    }

    /// Run one store call bounded by `operation_timeout` and by what is left
    /// of the write's `deadline`.
    async fn step<T>(
        &self,
        stage: WriteStage,
        deadline: Instant,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, WriteError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let timeout = remaining.min(self.config.operation_timeout);
        bounded(timeout, fut, || StoreError::Timeout)
            .await
            .map_err(|source| WriteError::store(stage, source))
    }
}

async fn rollback<T: StoreTransaction>(tx: T) {
    if let Err(e) = tx.rollback().await {
        // The transaction is gone either way; the store discards it.
        tracing::warn!(error = %e, "Rollback failed");
    }
}
