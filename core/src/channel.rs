//! Notification channel abstraction.
//!
//! This module provides the [`NotificationChannel`] trait: a publish/subscribe
//! bus the relay worker pushes outbox payloads into. The channel has **no
//! persistence**. A publish reaches only the subscribers connected at that
//! instant; nothing is queued for late subscribers.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │  outbox (store)  │◄─── Source of truth for "pending"
//! └────────┬─────────┘
//!          │ relay worker: lock batch, publish, mark, commit
//!          ▼
//! ┌──────────────────┐
//! │ Notification     │◄─── Fire-and-forget, no acknowledgement
//! │ Channel          │
//! └────────┬─────────┘
//!     ┌────┴────┐
//!     ▼         ▼
//! ┌───────┐ ┌───────┐
//! │ Email │ │ Other │
//! └───────┘ └───────┘
//! ```
//!
//! # Delivery Semantics
//!
//! - **At-least-once per publish attempt**: a row whose publish succeeded but
//!   whose status update did not commit is published again on a later tick.
//! - **Not durable**: `PROCESSED` certifies that a publish was made, not that
//!   any subscriber received it. A subscriber offline during every attempt
//!   never sees the event.
//! - **Idempotent consumers**: subscribers must tolerate duplicates, keyed by
//!   the identity carried in the payload.
//!
//! # Channel Naming
//!
//! Channels are named after the outbox record's event type, e.g.
//! `order.created`.
//!
//! # Implementations
//!
//! - `RedisNotificationChannel` (in `outbox-redis`): Redis `PUBLISH`/`SUBSCRIBE`
//! - `InMemoryChannel` (in `outbox-testing`): broadcast fan-out with failure injection

use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during channel operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The channel backend cannot be reached
    #[error("Channel unavailable: {0}")]
    Unavailable(String),

    /// Failed to publish a payload
    #[error("Publish failed for channel '{channel}': {reason}")]
    PublishFailed {
        /// The channel that failed
        channel: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe
    #[error("Subscription failed for channel '{channel}': {reason}")]
    SubscriptionFailed {
        /// The channel that failed to subscribe
        channel: String,
        /// The reason for failure
        reason: String,
    },

    /// The operation exceeded its deadline
    #[error("Channel operation timed out")]
    Timeout,
}

impl ChannelError {
    /// Whether the failure is transient. Every channel failure is: the outbox
    /// row stays pending and the next tick retries it.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        true
    }
}

/// Stream of raw payloads received on a subscription.
pub type PayloadStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, ChannelError>> + Send>>;

/// Trait for notification channel implementations.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// so it can be shared as `Arc<dyn NotificationChannel>` between the relay pool
/// and the subscribers of one process.
pub trait NotificationChannel: Send + Sync {
    /// Publish a payload to a channel.
    ///
    /// Fire-and-forget: success means the backend accepted the message, not
    /// that anyone received it.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::PublishFailed`] or [`ChannelError::Unavailable`]
    /// if the backend rejects or cannot take the message.
    fn publish(
        &self,
        channel: &str,
        payload: &[u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), ChannelError>> + Send + '_>>;

    /// Subscribe to a channel and receive a stream of payloads.
    ///
    /// Only payloads published after the subscription is established are
    /// delivered.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::SubscriptionFailed`] if the subscription fails.
    fn subscribe(
        &self,
        channel: &str,
    ) -> Pin<Box<dyn Future<Output = Result<PayloadStream, ChannelError>> + Send + '_>>;
}
