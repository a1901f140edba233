//! Outbox relay worker.
//!
//! Each pass claims a batch of pending outbox rows with a row-level lock that
//! other workers skip, publishes each row in creation order, marks it
//! processed and commits. A failure anywhere rolls the whole batch back: every
//! row returns to pending and is retried on a later pass, including rows that
//! were already published. Delivery is therefore at least once, and
//! subscribers must deduplicate.
//!
//! ```text
//!   begin ─► lock_pending(N) ─► for each row: publish ─► mark_processed ─► commit
//!                │                      │                    │              │
//!                └──────────────────────┴─── error ──────────┴──────────────┴─► rollback
//! ```

use crate::bounded;
use crate::metrics::RelayMetrics;
use outbox_core::channel::{ChannelError, NotificationChannel};
use outbox_core::error::{PublishError, RelayError, RelayStage};
use outbox_core::order::OutboxId;
use outbox_core::outbox::OutboxRecord;
use outbox_core::store::{DurableStore, StoreError, StoreTransaction};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::Instrument;

/// Configuration of a [`RelayWorker`].
///
/// # Default Values
///
/// - `batch_size`: 10 rows per pass
/// - `poll_interval`: 500ms between passes
/// - `operation_timeout`: 5 seconds per store or channel call
/// - `name`: `"relay"`
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Maximum rows claimed per pass
    pub batch_size: usize,
    /// Delay between the starts of consecutive passes
    pub poll_interval: Duration,
    /// Deadline for each store or channel call
    pub operation_timeout: Duration,
    /// Worker name, recorded on the `relay_batch` span
    pub name: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval: Duration::from_millis(500),
            operation_timeout: Duration::from_secs(5),
            name: "relay".to_string(),
        }
    }
}

impl RelayConfig {
    /// Set the batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the per-call deadline.
    #[must_use]
    pub const fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Set the worker name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Result of one committed pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Rows claimed by the pass
    pub claimed: usize,
    /// Rows published and marked processed, in publish order
    pub published: Vec<OutboxId>,
}

/// Drains pending outbox rows into a notification channel.
pub struct RelayWorker<D> {
    store: D,
    channel: Arc<dyn NotificationChannel>,
    config: RelayConfig,
}

impl<D> std::fmt::Debug for RelayWorker<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayWorker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<D: DurableStore> RelayWorker<D> {
    /// Create a worker.
    #[must_use]
    pub fn new(store: D, channel: Arc<dyn NotificationChannel>, config: RelayConfig) -> Self {
        Self {
            store,
            channel,
            config,
        }
    }

    /// The worker's configuration.
    #[must_use]
    pub const fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Run one pass.
    ///
    /// Publishing stops at the first failure; nothing of the batch is marked
    /// processed unless the commit succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError`] if any store call, publish or the commit fails.
    /// The batch has been rolled back when this returns an error, except that
    /// a commit that timed out may still have been applied by the store.
    pub async fn process_batch(&self) -> Result<BatchReport, RelayError> {
        let start = Instant::now();
        let mut tx = self.step(RelayStage::Begin, self.store.begin()).await?;

        let records = match self
            .step(RelayStage::Select, tx.lock_pending(self.config.batch_size))
            .await
        {
            Ok(records) => records,
            Err(err) => return Err(self.abort(tx, err).await),
        };

        if records.is_empty() {
            if let Err(e) = tx.rollback().await {
                tracing::debug!(error = %e, "Rollback of empty batch failed");
            }
            return Ok(BatchReport::default());
        }

        let claimed = records.len();
        RelayMetrics::record_claimed(claimed);
        tracing::debug!(claimed, "Claimed pending outbox rows");

        let published = match self.drain(&mut tx, &records).await {
            Ok(published) => published,
            Err(err) => return Err(self.abort(tx, err).await),
        };

        if let Err(err) = self.step(RelayStage::Commit, tx.commit()).await {
            RelayMetrics::record_abort(&err);
            tracing::error!(error = %err, claimed, "Relay commit failed; rows stay pending");
            return Err(err);
        }

        RelayMetrics::record_batch(published.len(), start.elapsed());
        tracing::info!(published = published.len(), "Relay batch committed");
        Ok(BatchReport { claimed, published })
    }

    async fn drain(
        &self,
        tx: &mut D::Transaction,
        records: &[OutboxRecord],
    ) -> Result<Vec<OutboxId>, RelayError> {
        let mut published = Vec::with_capacity(records.len());
        for record in records {
            self.publish(record).await?;
            self.step(RelayStage::MarkProcessed, tx.mark_processed(record.id))
                .await?;
            tracing::debug!(record_id = %record.id, event_type = %record.event_type, "Published outbox record");
            published.push(record.id);
        }
        Ok(published)
    }

    async fn publish(&self, record: &OutboxRecord) -> Result<(), PublishError> {
        bounded(
            self.config.operation_timeout,
            self.channel.publish(&record.event_type, &record.payload),
            || ChannelError::Timeout,
        )
        .await
        .map_err(|source| PublishError {
            record_id: record.id,
            channel: record.event_type.clone(),
            source,
        })
    }

    async fn abort(&self, tx: D::Transaction, err: RelayError) -> RelayError {
        RelayMetrics::record_abort(&err);
        tracing::warn!(error = %err, "Relay batch aborted; rolling back");
        if let Err(e) = tx.rollback().await {
            tracing::warn!(error = %e, "Rollback failed");
        }
        err
    }

    async fn step<T>(
        &self,
        stage: RelayStage,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, RelayError> {
        bounded(self.config.operation_timeout, fut, || StoreError::Timeout)
            .await
            .map_err(|source| RelayError::Store { stage, source })
    }

    /// Run passes every `poll_interval` until `shutdown` turns true.
    ///
    /// A failed pass is logged and the loop continues. Shutdown interrupts an
    /// in-flight pass; its uncommitted transaction rolls back when dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            worker = %self.config.name,
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis(),
            "Relay worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                _ = ticker.tick() => {}
            }

            let span = tracing::info_span!("relay_batch", worker = %self.config.name);
            tokio::select! {
                result = self.process_batch().instrument(span) => {
                    if let Err(e) = result {
                        tracing::debug!(worker = %self.config.name, error = %e, "Pass failed; retrying next tick");
                    }
                }
                _ = shutdown.wait_for(|stop| *stop) => {
                    tracing::info!(worker = %self.config.name, "Shutdown interrupted an in-flight batch");
                    break;
                }
            }
        }

        tracing::info!(worker = %self.config.name, "Relay worker stopped");
    }
}

/// Spawn `count` workers sharing one store and one channel.
///
/// Workers are named `relay-0`, `relay-1`, ... and stop when `shutdown`
/// turns true.
pub fn spawn_relay_workers<D>(
    store: &D,
    channel: &Arc<dyn NotificationChannel>,
    config: &RelayConfig,
    count: usize,
    shutdown: &watch::Receiver<bool>,
) -> Vec<JoinHandle<()>>
where
    D: DurableStore + Clone + 'static,
{
    (0..count)
        .map(|i| {
            let worker = RelayWorker::new(
                store.clone(),
                Arc::clone(channel),
                config.clone().with_name(format!("relay-{i}")),
            );
            tokio::spawn(worker.run(shutdown.clone()))
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use outbox_core::outbox::OutboxStatus;
    use outbox_testing::{InMemoryChannel, InMemoryStore, StoreOp, stepping_clock};

    fn worker(store: &InMemoryStore, channel: &InMemoryChannel) -> RelayWorker<InMemoryStore> {
        RelayWorker::new(store.clone(), Arc::new(channel.clone()), RelayConfig::default())
    }

    #[tokio::test]
    async fn publishes_in_creation_order_and_marks_processed() {
        let store = InMemoryStore::new();
        let channel = InMemoryChannel::new();
        let ids = store.seed_pending(3, &stepping_clock());

        let report = worker(&store, &channel).process_batch().await.unwrap();

        assert_eq!(report.claimed, 3);
        assert_eq!(report.published, ids);
        assert_eq!(channel.published().len(), 3);
        assert_eq!(store.count_with_status(OutboxStatus::Processed), 3);
        assert_eq!(store.held_locks(), 0);
    }

    #[tokio::test]
    async fn claims_at_most_batch_size() {
        let store = InMemoryStore::new();
        let channel = InMemoryChannel::new();
        store.seed_pending(25, &stepping_clock());

        let report = worker(&store, &channel).process_batch().await.unwrap();

        assert_eq!(report.claimed, 10);
        assert_eq!(store.count_with_status(OutboxStatus::Pending), 15);
    }

    #[tokio::test]
    async fn empty_table_is_a_no_op() {
        let store = InMemoryStore::new();
        let channel = InMemoryChannel::new();

        let report = worker(&store, &channel).process_batch().await.unwrap();

        assert_eq!(report, BatchReport::default());
        assert_eq!(channel.publish_attempts(), 0);
        assert_eq!(store.held_locks(), 0);
    }

    #[tokio::test]
    async fn publish_failure_rolls_back_whole_batch() {
        let store = InMemoryStore::new();
        let channel = InMemoryChannel::new();
        let ids = store.seed_pending(4, &stepping_clock());
        channel.fail_nth_publish(3);

        let err = worker(&store, &channel).process_batch().await.unwrap_err();

        match err {
            RelayError::Publish(PublishError { record_id, .. }) => assert_eq!(record_id, ids[2]),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(channel.published().len(), 2);
        assert_eq!(store.count_with_status(OutboxStatus::Pending), 4);
        assert_eq!(store.held_locks(), 0);
    }

    #[tokio::test]
    async fn commit_failure_keeps_rows_pending() {
        let store = InMemoryStore::new();
        let channel = InMemoryChannel::new();
        store.seed_pending(2, &stepping_clock());
        store.fail_once(StoreOp::Commit, StoreError::Unavailable("reset".into()));

        let err = worker(&store, &channel).process_batch().await.unwrap_err();

        assert_eq!(err.reason(), "commit");
        assert_eq!(store.count_with_status(OutboxStatus::Pending), 2);
    }

    #[tokio::test]
    async fn mark_failure_aborts_batch() {
        let store = InMemoryStore::new();
        let channel = InMemoryChannel::new();
        store.seed_pending(2, &stepping_clock());
        store.fail_once(StoreOp::MarkProcessed, StoreError::Query("deadlock".into()));

        let err = worker(&store, &channel).process_batch().await.unwrap_err();

        assert_eq!(err.reason(), "mark_processed");
        assert_eq!(store.count_with_status(OutboxStatus::Pending), 2);
        assert_eq!(store.held_locks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_drains_until_shutdown() {
        let store = InMemoryStore::new();
        let channel = InMemoryChannel::new();
        store.seed_pending(15, &stepping_clock());
        let (stop, shutdown) = watch::channel(false);

        let handle = tokio::spawn(worker(&store, &channel).run(shutdown));
        tokio::time::sleep(Duration::from_millis(1200)).await;
        stop.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(store.count_with_status(OutboxStatus::Processed), 15);
        assert_eq!(channel.published().len(), 15);
    }
}
