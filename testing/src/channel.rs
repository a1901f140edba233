//! In-memory notification channel.
//!
//! Fan-out uses one `tokio::sync::broadcast` sender per channel name. Like the
//! production channel it has no persistence: a publish with no live subscriber
//! is accepted and lost.

use outbox_core::channel::{ChannelError, NotificationChannel, PayloadStream};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;

const SUBSCRIBER_BUFFER: usize = 1024;

/// A publish accepted by the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    /// Channel name
    pub channel: String,
    /// Raw payload
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct State {
    senders: HashMap<String, broadcast::Sender<Vec<u8>>>,
    published: Vec<Published>,
    attempts: usize,
    fail_at: Vec<usize>,
    unavailable: bool,
}

/// In-memory pub/sub channel with publish failure injection.
///
/// Clones share the same channels and publish log.
#[derive(Debug, Clone, Default)]
pub struct InMemoryChannel {
    state: Arc<Mutex<State>>,
}

impl InMemoryChannel {
    /// Create an empty channel.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Make the `n`-th publish attempt from now fail (1-based).
    pub fn fail_nth_publish(&self, n: usize) {
        self.with_state(|s| {
            let target = s.attempts + n;
            s.fail_at.push(target);
        });
    }

    /// Reject every publish and subscribe while `unavailable` is true.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.with_state(|s| s.unavailable = unavailable);
    }

    /// Every accepted publish, in order.
    #[must_use]
    pub fn published(&self) -> Vec<Published> {
        self.with_state(|s| s.published.clone())
    }

    /// Number of publish attempts, accepted or not.
    #[must_use]
    pub fn publish_attempts(&self) -> usize {
        self.with_state(|s| s.attempts)
    }

    fn try_publish(&self, channel: &str, payload: &[u8]) -> Result<(), ChannelError> {
        self.with_state(|s| {
            s.attempts += 1;
            if s.unavailable {
                return Err(ChannelError::Unavailable("channel offline".to_string()));
            }
            let attempt = s.attempts;
            if let Some(pos) = s.fail_at.iter().position(|n| *n == attempt) {
                s.fail_at.swap_remove(pos);
                return Err(ChannelError::PublishFailed {
                    channel: channel.to_string(),
                    reason: format!("injected failure on attempt {attempt}"),
                });
            }
            if let Some(sender) = s.senders.get(channel) {
                // No receivers is not an error: the message is simply lost.
                let _ = sender.send(payload.to_vec());
            }
            s.published.push(Published {
                channel: channel.to_string(),
                payload: payload.to_vec(),
            });
            Ok(())
        })
    }

    fn receiver(&self, channel: &str) -> Result<broadcast::Receiver<Vec<u8>>, ChannelError> {
        self.with_state(|s| {
            if s.unavailable {
                return Err(ChannelError::SubscriptionFailed {
                    channel: channel.to_string(),
                    reason: "channel offline".to_string(),
                });
            }
            Ok(s.senders
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(SUBSCRIBER_BUFFER).0)
                .subscribe())
        })
    }
}

impl NotificationChannel for InMemoryChannel {
    fn publish(
        &self,
        channel: &str,
        payload: &[u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), ChannelError>> + Send + '_>> {
        let result = self.try_publish(channel, payload);
        Box::pin(async move { result })
    }

    fn subscribe(
        &self,
        channel: &str,
    ) -> Pin<Box<dyn Future<Output = Result<PayloadStream, ChannelError>> + Send + '_>> {
        let result = self.receiver(channel);
        Box::pin(async move {
            let mut rx = result?;
            let stream = async_stream::stream! {
                loop {
                    match rx.recv().await {
                        Ok(payload) => yield Ok(payload),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "In-memory subscriber lagged, payloads dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            };
            Ok(Box::pin(stream) as PayloadStream)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn subscribers_receive_only_later_publishes() {
        let channel = InMemoryChannel::new();
        channel.publish("order.created", b"early").await.unwrap();

        let mut stream = channel.subscribe("order.created").await.unwrap();
        channel.publish("order.created", b"late").await.unwrap();

        assert_eq!(stream.next().await.unwrap().unwrap(), b"late".to_vec());
        assert_eq!(channel.published().len(), 2);
    }

    #[tokio::test]
    async fn nth_publish_fails_once() {
        let channel = InMemoryChannel::new();
        channel.fail_nth_publish(2);

        assert!(channel.publish("c", b"1").await.is_ok());
        assert!(channel.publish("c", b"2").await.is_err());
        assert!(channel.publish("c", b"3").await.is_ok());
        assert_eq!(channel.publish_attempts(), 3);
        assert_eq!(channel.published().len(), 2);
    }

    #[tokio::test]
    async fn unavailable_channel_rejects_everything() {
        let channel = InMemoryChannel::new();
        channel.set_unavailable(true);

        assert!(matches!(
            channel.publish("c", b"x").await,
            Err(ChannelError::Unavailable(_))
        ));
        assert!(channel.subscribe("c").await.is_err());
    }
}
