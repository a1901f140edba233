//! # Outbox Runtime
//!
//! The consistency and delivery engine of the transactional outbox.
//!
//! - [`guard::IdempotencyGuard`]: admits, completes and releases idempotency tokens
//! - [`writer::TransactionalWriter`]: commits an order and its outbox event atomically
//! - [`service::OrderService`]: the write path, guard around writer
//! - [`relay::RelayWorker`]: drains pending outbox rows into the notification channel
//!
//! Every component is stateless between calls. All state lives in the external
//! stores, reached through the traits in `outbox-core`, so each component can
//! be driven against the in-memory collaborators of `outbox-testing`.
//!
//! ## Deadlines
//!
//! Each external call is bounded by the component's configured operation
//! timeout. An elapsed deadline surfaces as the `Timeout` variant of the
//! relevant error, which is transient. Dropping any returned future cancels
//! the work; an uncommitted store transaction rolls back when dropped.

pub mod guard;
pub mod metrics;
pub mod relay;
pub mod retry;
pub mod service;
pub mod writer;

pub use guard::{GuardConfig, IdempotencyGuard};
pub use relay::{BatchReport, RelayConfig, RelayWorker, spawn_relay_workers};
pub use service::{CreateOrderOutcome, NewOrder, OrderReceipt, OrderService};
pub use writer::{TransactionalWriter, WriterConfig};

use std::future::Future;
use std::time::Duration;

/// Run `fut` under `timeout`, mapping an elapsed deadline to `on_elapsed()`.
pub(crate) async fn bounded<T, E, F>(
    timeout: Duration,
    fut: F,
    on_elapsed: impl FnOnce() -> E,
) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .unwrap_or_else(|_| Err(on_elapsed()))
}
