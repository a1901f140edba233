//! In-memory durable store.
//!
//! [`InMemoryStore`] keeps `orders` and `outbox` behind one mutex and gives
//! each transaction a private write buffer, so nothing a transaction writes is
//! visible before commit. Row locks taken by
//! [`lock_pending`](StoreTransaction::lock_pending) are owned by the
//! transaction and skipped by every other locker, which reproduces
//! `FOR UPDATE SKIP LOCKED`. Locks are released on commit, rollback, or drop.
//!
//! Every operation can be made to fail ([`InMemoryStore::fail_once`],
//! [`InMemoryStore::fail_always`]) or to take time
//! ([`InMemoryStore::set_latency`]), and every call is counted.

use outbox_core::environment::Clock;
use outbox_core::order::{Order, OrderId, OutboxId, UserId};
use outbox_core::outbox::{OutboxRecord, OutboxStatus};
use outbox_core::store::{DurableStore, StoreError, StoreTransaction};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Store operation, used to target failure injection, latency and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    /// [`DurableStore::begin`]
    Begin,
    /// [`StoreTransaction::insert_order`]
    InsertOrder,
    /// [`StoreTransaction::insert_outbox`]
    InsertOutbox,
    /// [`StoreTransaction::lock_pending`]
    LockPending,
    /// [`StoreTransaction::mark_processed`]
    MarkProcessed,
    /// [`StoreTransaction::commit`]
    Commit,
}

#[derive(Debug, Clone)]
enum Fault {
    Once(StoreError),
    Always(StoreError),
}

/// Rows handed to one transaction by one `lock_pending` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockedBatch {
    /// Transaction that took the locks
    pub transaction: u64,
    /// Locked record ids, in the order they were returned
    pub ids: Vec<OutboxId>,
}

#[derive(Debug, Default)]
struct State {
    orders: HashMap<OrderId, Order>,
    outbox: Vec<OutboxRecord>,
    locks: HashMap<OutboxId, u64>,
    next_tx: u64,
    faults: HashMap<StoreOp, Fault>,
    latency: HashMap<StoreOp, Duration>,
    calls: HashMap<StoreOp, usize>,
    batches: Vec<LockedBatch>,
    transitions: HashMap<OutboxId, usize>,
}

impl State {
    /// Count the call and fire any injected fault.
    fn enter(&mut self, op: StoreOp) -> Result<(), StoreError> {
        *self.calls.entry(op).or_default() += 1;
        match self.faults.get(&op).cloned() {
            Some(Fault::Once(err)) => {
                self.faults.remove(&op);
                Err(err)
            }
            Some(Fault::Always(err)) => Err(err),
            None => Ok(()),
        }
    }

    fn release(&mut self, tx: u64) {
        self.locks.retain(|_, owner| *owner != tx);
    }

    fn pending_sorted(&self) -> Vec<&OutboxRecord> {
        let mut rows: Vec<&OutboxRecord> = self.outbox.iter().filter(|r| r.is_pending()).collect();
        rows.sort_by_key(|r| r.created_at);
        rows
    }
}

/// In-memory transactional store for fast, deterministic tests.
///
/// Clones share the same tables, like handles onto one database.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    fn latency(&self, op: StoreOp) -> Option<Duration> {
        self.with_state(|s| s.latency.get(&op).copied())
    }

    /// Make the next call of `op` fail with `err`.
    pub fn fail_once(&self, op: StoreOp, err: StoreError) {
        self.with_state(|s| s.faults.insert(op, Fault::Once(err)));
    }

    /// Make every call of `op` fail with `err` until [`clear_faults`](Self::clear_faults).
    pub fn fail_always(&self, op: StoreOp, err: StoreError) {
        self.with_state(|s| s.faults.insert(op, Fault::Always(err)));
    }

    /// Remove every injected fault.
    pub fn clear_faults(&self) {
        self.with_state(|s| s.faults.clear());
    }

    /// Delay every call of `op` by `latency` (tokio time).
    pub fn set_latency(&self, op: StoreOp, latency: Duration) {
        self.with_state(|s| s.latency.insert(op, latency));
    }

    /// Number of times `op` was called, including failed calls.
    #[must_use]
    pub fn calls(&self, op: StoreOp) -> usize {
        self.with_state(|s| s.calls.get(&op).copied().unwrap_or_default())
    }

    /// Committed orders.
    #[must_use]
    pub fn orders(&self) -> Vec<Order> {
        self.with_state(|s| s.orders.values().cloned().collect())
    }

    /// Committed outbox records, oldest first.
    #[must_use]
    pub fn outbox(&self) -> Vec<OutboxRecord> {
        self.with_state(|s| {
            let mut rows = s.outbox.clone();
            rows.sort_by_key(|r| r.created_at);
            rows
        })
    }

    /// Committed outbox records whose payload is a snapshot of `order_id`.
    #[must_use]
    pub fn outbox_for_order(&self, order_id: OrderId) -> Vec<OutboxRecord> {
        self.outbox()
            .into_iter()
            .filter(|r| Order::from_event_payload(&r.payload).is_ok_and(|o| o.id == order_id))
            .collect()
    }

    /// Number of committed records with `status`.
    #[must_use]
    pub fn count_with_status(&self, status: OutboxStatus) -> usize {
        self.with_state(|s| s.outbox.iter().filter(|r| r.status == status).count())
    }

    /// Every batch handed out by `lock_pending`, in call order.
    #[must_use]
    pub fn locked_batches(&self) -> Vec<LockedBatch> {
        self.with_state(|s| s.batches.clone())
    }

    /// Number of committed PENDING → PROCESSED transitions of `id`.
    #[must_use]
    pub fn transitions(&self, id: OutboxId) -> usize {
        self.with_state(|s| s.transitions.get(&id).copied().unwrap_or_default())
    }

    /// Number of row locks currently held by open transactions.
    #[must_use]
    pub fn held_locks(&self) -> usize {
        self.with_state(|s| s.locks.len())
    }

    /// Commit `count` orders with their pending `order.created` records,
    /// bypassing transactions and fault injection.
    ///
    /// Returns the outbox ids in creation order.
    pub fn seed_pending(&self, count: usize, clock: &dyn Clock) -> Vec<OutboxId> {
        (0..count)
            .filter_map(|_| {
                let order = Order::new(UserId::new(), 1000);
                let record = OutboxRecord::order_created(&order, clock.now()).ok()?;
                let id = record.id;
                self.with_state(|s| {
                    s.orders.insert(order.id, order);
                    s.outbox.push(record);
                });
                Some(id)
            })
            .collect()
    }
}

impl DurableStore for InMemoryStore {
    type Transaction = InMemoryTransaction;

    async fn begin(&self) -> Result<InMemoryTransaction, StoreError> {
        if let Some(latency) = self.latency(StoreOp::Begin) {
            tokio::time::sleep(latency).await;
        }
        let id = self.with_state(|s| {
            s.enter(StoreOp::Begin)?;
            s.next_tx += 1;
            Ok::<_, StoreError>(s.next_tx)
        })?;

        Ok(InMemoryTransaction {
            id,
            store: self.clone(),
            orders: Vec::new(),
            outbox: Vec::new(),
            processed: Vec::new(),
            open: true,
        })
    }

    async fn find_order(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        Ok(self.with_state(|s| s.orders.get(&id).cloned()))
    }
}

/// Open transaction on an [`InMemoryStore`].
#[derive(Debug)]
pub struct InMemoryTransaction {
    id: u64,
    store: InMemoryStore,
    orders: Vec<Order>,
    outbox: Vec<OutboxRecord>,
    processed: Vec<OutboxId>,
    open: bool,
}

impl InMemoryTransaction {
    /// Transaction number, matching [`LockedBatch::transaction`].
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    async fn delay(&self, op: StoreOp) {
        if let Some(latency) = self.store.latency(op) {
            tokio::time::sleep(latency).await;
        }
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            let id = self.id;
            self.store.with_state(|s| s.release(id));
        }
    }
}

impl StoreTransaction for InMemoryTransaction {
    async fn insert_order(&mut self, order: &Order) -> Result<(), StoreError> {
        self.delay(StoreOp::InsertOrder).await;
        let duplicate_pending = self.orders.iter().any(|o| o.id == order.id);
        self.store.with_state(|s| {
            s.enter(StoreOp::InsertOrder)?;
            if duplicate_pending || s.orders.contains_key(&order.id) {
                return Err(StoreError::Conflict(format!("order {} already exists", order.id)));
            }
            Ok(())
        })?;
        self.orders.push(order.clone());
        Ok(())
    }

    async fn insert_outbox(&mut self, record: &OutboxRecord) -> Result<(), StoreError> {
        self.delay(StoreOp::InsertOutbox).await;
        let duplicate_pending = self.outbox.iter().any(|r| r.id == record.id);
        self.store.with_state(|s| {
            s.enter(StoreOp::InsertOutbox)?;
            if duplicate_pending || s.outbox.iter().any(|r| r.id == record.id) {
                return Err(StoreError::Conflict(format!(
                    "outbox record {} already exists",
                    record.id
                )));
            }
            Ok(())
        })?;
        self.outbox.push(record.clone());
        Ok(())
    }

    async fn lock_pending(&mut self, limit: usize) -> Result<Vec<OutboxRecord>, StoreError> {
        self.delay(StoreOp::LockPending).await;
        let tx = self.id;
        self.store.with_state(|s| {
            s.enter(StoreOp::LockPending)?;
            let claimed: Vec<OutboxRecord> = s
                .pending_sorted()
                .into_iter()
                .filter(|r| s.locks.get(&r.id).is_none_or(|owner| *owner == tx))
                .take(limit)
                .cloned()
                .collect();
            for record in &claimed {
                s.locks.insert(record.id, tx);
            }
            s.batches.push(LockedBatch {
                transaction: tx,
                ids: claimed.iter().map(|r| r.id).collect(),
            });
            Ok(claimed)
        })
    }

    async fn mark_processed(&mut self, id: OutboxId) -> Result<(), StoreError> {
        self.delay(StoreOp::MarkProcessed).await;
        let tx = self.id;
        self.store.with_state(|s| {
            s.enter(StoreOp::MarkProcessed)?;
            match s.locks.get(&id) {
                Some(owner) if *owner == tx => Ok(()),
                Some(_) => Err(StoreError::Query(format!("outbox record {id} is locked by another transaction"))),
                None if s.outbox.iter().any(|r| r.id == id) => Ok(()),
                None => Err(StoreError::Query(format!("outbox record {id} does not exist"))),
            }
        })?;
        self.processed.push(id);
        Ok(())
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        self.delay(StoreOp::Commit).await;
        let tx = self.id;
        let orders = std::mem::take(&mut self.orders);
        let outbox = std::mem::take(&mut self.outbox);
        let processed = std::mem::take(&mut self.processed);

        let result = self.store.with_state(|s| {
            s.enter(StoreOp::Commit)?;
            if let Some(dup) = orders.iter().find(|o| s.orders.contains_key(&o.id)) {
                return Err(StoreError::Conflict(format!("order {} already exists", dup.id)));
            }
            for order in orders {
                s.orders.insert(order.id, order);
            }
            s.outbox.extend(outbox);
            for id in processed {
                if let Some(row) = s.outbox.iter_mut().find(|r| r.id == id && r.is_pending()) {
                    row.status = OutboxStatus::Processed;
                    *s.transitions.entry(id).or_default() += 1;
                }
            }
            s.release(tx);
            Ok(())
        });

        // A failed commit is a rollback.
        self.close();
        result
    }

    async fn rollback(mut self) -> Result<(), StoreError> {
        self.close();
        Ok(())
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::stepping_clock;
    use proptest::prelude::*;

    #[tokio::test]
    async fn uncommitted_writes_are_invisible() {
        let store = InMemoryStore::new();
        let order = Order::new(UserId::new(), 10);

        let mut tx = store.begin().await.unwrap();
        tx.insert_order(&order).await.unwrap();
        assert!(store.find_order(order.id).await.unwrap().is_none());

        tx.commit().await.unwrap();
        assert_eq!(store.find_order(order.id).await.unwrap(), Some(order));
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back_and_releases_locks() {
        let store = InMemoryStore::new();
        store.seed_pending(3, &stepping_clock());

        {
            let mut tx = store.begin().await.unwrap();
            let rows = tx.lock_pending(10).await.unwrap();
            assert_eq!(rows.len(), 3);
            tx.mark_processed(rows[0].id).await.unwrap();
            assert_eq!(store.held_locks(), 3);
        }

        assert_eq!(store.held_locks(), 0);
        assert_eq!(store.count_with_status(OutboxStatus::Pending), 3);
    }

    #[tokio::test]
    async fn concurrent_lockers_get_disjoint_rows() {
        let store = InMemoryStore::new();
        store.seed_pending(5, &stepping_clock());

        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        let a = first.lock_pending(3).await.unwrap();
        let b = second.lock_pending(3).await.unwrap();

        assert_eq!(a.len(), 3);
        assert_eq!(b.len(), 2);
        assert!(a.iter().all(|r| b.iter().all(|o| o.id != r.id)));
    }

    #[tokio::test]
    async fn failed_commit_discards_everything() {
        let store = InMemoryStore::new();
        store.fail_once(StoreOp::Commit, StoreError::Timeout);
        let order = Order::new(UserId::new(), 10);

        let mut tx = store.begin().await.unwrap();
        tx.insert_order(&order).await.unwrap();
        assert_eq!(tx.commit().await, Err(StoreError::Timeout));

        assert!(store.orders().is_empty());
        assert_eq!(store.calls(StoreOp::Commit), 1);
    }

    #[tokio::test]
    async fn duplicate_order_is_a_conflict() {
        let store = InMemoryStore::new();
        let order = Order::new(UserId::new(), 10);

        let mut tx = store.begin().await.unwrap();
        tx.insert_order(&order).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let err = tx.insert_order(&order).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    proptest! {
        #[test]
        fn lockers_partition_pending_rows_in_creation_order(
            rows in 0usize..40,
            first_limit in 1usize..20,
            second_limit in 1usize..20,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            runtime.block_on(async {
                let store = InMemoryStore::new();
                let seeded = store.seed_pending(rows, &stepping_clock());

                let mut first = store.begin().await.unwrap();
                let mut second = store.begin().await.unwrap();
                let a: Vec<OutboxId> = first.lock_pending(first_limit).await.unwrap().iter().map(|r| r.id).collect();
                let b: Vec<OutboxId> = second.lock_pending(second_limit).await.unwrap().iter().map(|r| r.id).collect();

                let expected_a: Vec<OutboxId> = seeded.iter().copied().take(first_limit).collect();
                let expected_b: Vec<OutboxId> = seeded.iter().copied().skip(first_limit).take(second_limit).collect();
                prop_assert_eq!(a, expected_a);
                prop_assert_eq!(b, expected_b);
                Ok(())
            })?;
        }
    }
}
