//! Order creation: the idempotency guard wrapped around the transactional writer.

use crate::guard::IdempotencyGuard;
use crate::metrics::OrderMetrics;
use crate::writer::TransactionalWriter;
use outbox_core::error::CreateOrderError;
use outbox_core::idempotency::{Admission, IdempotencyStore, IdempotencyToken};
use outbox_core::order::{Order, OrderId, UserId};
use outbox_core::store::DurableStore;
use serde::{Deserialize, Serialize};

/// Order data supplied by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewOrder {
    /// Ordering user
    pub user_id: UserId,
    /// Amount in minor units
    pub amount: i64,
}

/// The response cached under an idempotency token and returned to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderReceipt {
    /// Created order
    pub order_id: OrderId,
    /// Ordering user
    pub user_id: UserId,
    /// Amount in minor units
    pub amount: i64,
}

impl From<&Order> for OrderReceipt {
    fn from(order: &Order) -> Self {
        Self {
            order_id: order.id,
            user_id: order.user_id,
            amount: order.amount,
        }
    }
}

/// Successful outcome of [`OrderService::create_order`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOrderOutcome {
    /// A new order was committed by this request
    Created(OrderReceipt),
    /// An earlier request with the same token committed; this is its response
    Replayed(OrderReceipt),
}

impl CreateOrderOutcome {
    /// The receipt, whichever way it was produced.
    #[must_use]
    pub const fn receipt(&self) -> &OrderReceipt {
        match self {
            Self::Created(r) | Self::Replayed(r) => r,
        }
    }

    /// Whether the receipt came from the idempotency cache.
    #[must_use]
    pub const fn is_replay(&self) -> bool {
        matches!(self, Self::Replayed(_))
    }
}

/// The write path.
#[derive(Debug, Clone)]
pub struct OrderService<D, K> {
    guard: IdempotencyGuard<K>,
    writer: TransactionalWriter<D>,
}

impl<D: DurableStore, K: IdempotencyStore> OrderService<D, K> {
    /// Create a service.
    #[must_use]
    pub const fn new(guard: IdempotencyGuard<K>, writer: TransactionalWriter<D>) -> Self {
        Self { guard, writer }
    }

    /// The durable store behind the writer.
    #[must_use]
    pub const fn store(&self) -> &D {
        self.writer.store()
    }

    /// Create an order at most once per `token`.
    ///
    /// 1. Admit the token. An in-flight token is rejected, a completed one
    ///    replays its cached receipt without touching the store.
    /// 2. Write the order and its outbox event in one transaction.
    /// 3. On failure release this request's lock so the client may retry at
    ///    once (a lock that expired and was taken over is left alone); on
    ///    success cache the receipt.
    ///
    /// A receipt that fails to cache is still returned. The marker then
    /// expires after the lock TTL and a later retry would write again.
    ///
    /// # Errors
    ///
    /// - [`CreateOrderError::LockContention`] if the token is in flight
    /// - [`CreateOrderError::Idempotency`] if the guard's store fails on admit
    /// - [`CreateOrderError::Write`] if the transactional write fails
    pub async fn create_order(
        &self,
        token: &IdempotencyToken,
        new_order: NewOrder,
    ) -> Result<CreateOrderOutcome, CreateOrderError> {
        let holder = match self.guard.admit::<OrderReceipt>(token).await? {
            Admission::InFlight => {
                OrderMetrics::record_rejected_in_flight();
                tracing::info!(token = %token, "Rejected: request in flight");
                return Err(CreateOrderError::LockContention);
            }
            Admission::CachedResult(receipt) => {
                OrderMetrics::record_replayed();
                tracing::info!(token = %token, order_id = %receipt.order_id, "Replayed cached receipt");
                return Ok(CreateOrderOutcome::Replayed(receipt));
            }
            Admission::Proceed(holder) => holder,
        };

        let order = Order::new(new_order.user_id, new_order.amount);
        if let Err(err) = self.writer.create_order(&order).await {
            if let Err(release_err) = self.guard.release(token, &holder).await {
                tracing::warn!(
                    token = %token,
                    error = %release_err,
                    "Failed to release idempotency lock; it expires after the lock TTL"
                );
            }
            return Err(err.into());
        }

        let receipt = OrderReceipt::from(&order);
        if let Err(e) = self.guard.complete(token, &receipt).await {
            tracing::warn!(token = %token, error = %e, "Failed to cache receipt");
        }
        Ok(CreateOrderOutcome::Created(receipt))
    }
}
