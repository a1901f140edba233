//! Redis pub/sub notification channel.
//!
//! Messages published while nobody is subscribed are dropped by Redis. The
//! outbox row is the durable copy; the relay only needs `PUBLISH` to succeed.

use crate::is_connectivity;
use futures::StreamExt;
use outbox_core::channel::{ChannelError, NotificationChannel, PayloadStream};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};
use std::future::Future;
use std::pin::Pin;

fn publish_error(channel: &str, e: &RedisError) -> ChannelError {
    if e.is_timeout() {
        ChannelError::Timeout
    } else if is_connectivity(e) {
        ChannelError::Unavailable(e.to_string())
    } else {
        ChannelError::PublishFailed {
            channel: channel.to_string(),
            reason: e.to_string(),
        }
    }
}

/// Notification channel over Redis `PUBLISH`/`SUBSCRIBE`.
#[derive(Clone)]
pub struct RedisNotificationChannel {
    client: Client,
    conn_manager: ConnectionManager,
}

impl std::fmt::Debug for RedisNotificationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisNotificationChannel")
            .finish_non_exhaustive()
    }
}

impl RedisNotificationChannel {
    /// Connect to `redis_url`.
    ///
    /// Subscriptions open their own dedicated connections.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Unavailable`] if the client cannot be created
    /// or the publishing connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, ChannelError> {
        let client = Client::open(redis_url).map_err(|e| {
            ChannelError::Unavailable(format!("Failed to create Redis client: {e}"))
        })?;
        let conn_manager = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| ChannelError::Unavailable(format!("Failed to connect to Redis: {e}")))?;

        Ok(Self {
            client,
            conn_manager,
        })
    }
}

impl NotificationChannel for RedisNotificationChannel {
    fn publish(
        &self,
        channel: &str,
        payload: &[u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), ChannelError>> + Send + '_>> {
        let channel = channel.to_string();
        let payload = payload.to_vec();
        let mut conn = self.conn_manager.clone();

        Box::pin(async move {
            let receivers: i64 = conn
                .publish(&channel, payload)
                .await
                .map_err(|e| publish_error(&channel, &e))?;

            tracing::trace!(channel = %channel, receivers, "Published");
            Ok(())
        })
    }

    fn subscribe(
        &self,
        channel: &str,
    ) -> Pin<Box<dyn Future<Output = Result<PayloadStream, ChannelError>> + Send + '_>> {
        let channel = channel.to_string();
        let client = self.client.clone();

        Box::pin(async move {
            let subscription_failed = |e: RedisError| ChannelError::SubscriptionFailed {
                channel: channel.clone(),
                reason: e.to_string(),
            };

            let mut pubsub = client
                .get_async_pubsub()
                .await
                .map_err(subscription_failed)?;
            pubsub
                .subscribe(&channel)
                .await
                .map_err(subscription_failed)?;

            tracing::info!(channel = %channel, "Subscribed");

            let stream = pubsub
                .into_on_message()
                .map(|msg| Ok(msg.get_payload_bytes().to_vec()));
            Ok(Box::pin(stream) as PayloadStream)
        })
    }
}
