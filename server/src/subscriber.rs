//! Order confirmation subscriber.
//!
//! Listens on `order.created` and sends (logs) one confirmation per order.
//! The relay delivers at least once, so a payload can arrive more than once;
//! order ids seen recently are remembered and repeats are skipped. The window
//! is bounded, so a duplicate arriving after `capacity` newer orders is
//! confirmed again.

use futures::StreamExt;
use outbox_core::channel::NotificationChannel;
use outbox_core::order::{Order, OrderId};
use outbox_core::outbox::ORDER_CREATED;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Default number of order ids remembered for deduplication.
pub const DEFAULT_DEDUP_CAPACITY: usize = 10_000;

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// What happened to one delivered payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// First delivery of this order; confirmation sent
    Confirmed(Order),
    /// Order already confirmed within the window
    Duplicate(OrderId),
    /// Payload is not an order snapshot
    Malformed,
}

/// Bounded set of recently seen order ids, evicting the oldest.
#[derive(Debug)]
pub struct RecentlySeen {
    capacity: usize,
    order: VecDeque<OrderId>,
    ids: HashSet<OrderId>,
}

impl RecentlySeen {
    /// Remember up to `capacity` ids (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
        }
    }

    /// Record `id`; returns `false` if it was already present.
    pub fn insert(&mut self, id: OrderId) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
        true
    }

    /// Number of remembered ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether nothing is remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Sends one confirmation per order.
#[derive(Debug)]
pub struct ConfirmationSubscriber {
    seen: RecentlySeen,
}

impl ConfirmationSubscriber {
    /// Create a subscriber remembering `capacity` order ids.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: RecentlySeen::new(capacity),
        }
    }

    /// Handle one payload from the channel.
    pub fn handle(&mut self, payload: &[u8]) -> Delivery {
        let order = match Order::from_event_payload(payload) {
            Ok(order) => order,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed order.created payload");
                return Delivery::Malformed;
            }
        };

        if !self.seen.insert(order.id) {
            tracing::debug!(order_id = %order.id, "Duplicate delivery, confirmation already sent");
            return Delivery::Duplicate(order.id);
        }

        tracing::info!(
            order_id = %order.id,
            user_id = %order.user_id,
            amount = order.amount,
            "Sending order confirmation email"
        );
        Delivery::Confirmed(order)
    }

    /// Consume `order.created` until `shutdown` turns true.
    ///
    /// A failed subscription or a closed stream is retried after a short delay.
    pub async fn run(
        mut self,
        channel: Arc<dyn NotificationChannel>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let mut stream = tokio::select! {
                () = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
                subscribed = channel.subscribe(ORDER_CREATED) => match subscribed {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::warn!(error = %e, "Subscription failed, retrying");
                        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                        continue;
                    }
                },
            };
            tracing::info!(channel = ORDER_CREATED, "Confirmation subscriber listening");

            loop {
                tokio::select! {
                    _ = shutdown.wait_for(|stop| *stop) => {
                        tracing::info!("Confirmation subscriber stopped");
                        return;
                    }
                    next = stream.next() => match next {
                        Some(Ok(payload)) => {
                            self.handle(&payload);
                        }
                        Some(Err(e)) => tracing::warn!(error = %e, "Subscription error"),
                        None => {
                            tracing::warn!("Subscription closed, resubscribing");
                            break;
                        }
                    },
                }
            }
            tokio::time::sleep(RESUBSCRIBE_DELAY).await;
        }
        tracing::info!("Confirmation subscriber stopped");
    }
}

impl Default for ConfirmationSubscriber {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}
