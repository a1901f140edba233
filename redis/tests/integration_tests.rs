//! Integration tests for the Redis adapters using testcontainers.
//!
//! # Requirements
//!
//! Docker must be running to execute these tests.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)] // Test code uses expect for clear failure messages

use futures::StreamExt;
use outbox_core::channel::NotificationChannel;
use outbox_core::idempotency::{Admission, IN_FLIGHT_MARKER, IdempotencyStore};
use outbox_redis::{RedisIdempotencyStore, RedisNotificationChannel};
use outbox_runtime::{GuardConfig, IdempotencyGuard};
use std::time::Duration;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;

/// Start a Redis container and return its URL.
///
/// # Panics
/// Panics if container setup fails (test environment issue).
async fn setup_redis() -> (ContainerAsync<Redis>, String) {
    let container = Redis::default()
        .start()
        .await
        .expect("Failed to start redis container");
    let port = container
        .get_host_port_ipv4(6379)
        .await
        .expect("Failed to get redis port");

    (container, format!("redis://127.0.0.1:{port}"))
}

#[tokio::test]
async fn test_set_if_absent_returns_existing_value() {
    let (_container, url) = setup_redis().await;
    let store = RedisIdempotencyStore::connect(&url).await.expect("connect");
    store.ping().await.expect("ping");

    let first = store
        .set_if_absent("idempotency:a", IN_FLIGHT_MARKER, Duration::from_secs(30))
        .await
        .expect("first");
    let second = store
        .set_if_absent("idempotency:a", "ignored", Duration::from_secs(30))
        .await
        .expect("second");

    assert_eq!(first, None);
    assert_eq!(second.as_deref(), Some(IN_FLIGHT_MARKER));
}

#[tokio::test]
async fn test_keys_expire() {
    let (_container, url) = setup_redis().await;
    let store = RedisIdempotencyStore::connect(&url).await.expect("connect");

    store
        .set_if_absent("idempotency:short", IN_FLIGHT_MARKER, Duration::from_millis(100))
        .await
        .expect("set");
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(store.get("idempotency:short").await.expect("get"), None);
}

#[tokio::test]
async fn test_concurrent_admission_has_one_winner() {
    let (_container, url) = setup_redis().await;
    let store = RedisIdempotencyStore::connect(&url).await.expect("connect");
    let guard = IdempotencyGuard::new(store, GuardConfig::default());
    let token = "race".parse().unwrap();

    let results = futures::future::join_all((0..50).map(|_| guard.admit::<String>(&token))).await;

    let proceeded = results
        .iter()
        .filter(|r| matches!(r, Ok(Admission::Proceed(_))))
        .count();
    let in_flight = results
        .iter()
        .filter(|r| matches!(r, Ok(Admission::InFlight)))
        .count();
    assert_eq!(proceeded, 1);
    assert_eq!(in_flight, 49);
}

#[tokio::test]
async fn test_complete_then_release() {
    let (_container, url) = setup_redis().await;
    let store = RedisIdempotencyStore::connect(&url).await.expect("connect");
    let guard = IdempotencyGuard::new(store.clone(), GuardConfig::default());
    let token = "done".parse().unwrap();

    let Admission::Proceed(holder) = guard.admit::<String>(&token).await.expect("admit") else {
        panic!("first admit must proceed");
    };
    guard.complete(&token, &"receipt".to_string()).await.expect("complete");
    assert_eq!(
        guard.admit::<String>(&token).await.expect("replay"),
        Admission::CachedResult("receipt".to_string())
    );

    // A cached response is not a lock and survives a late release.
    assert!(!guard.release(&token, &holder).await.expect("release"));
    assert!(store.get("idempotency:done").await.expect("get").is_some());
}

#[tokio::test]
async fn test_release_only_deletes_own_marker() {
    let (_container, url) = setup_redis().await;
    let store = RedisIdempotencyStore::connect(&url).await.expect("connect");

    store
        .set("idempotency:cas", "__in_flight__:newer", Duration::from_secs(30))
        .await
        .expect("set");

    assert!(!store
        .delete_if_equals("idempotency:cas", "__in_flight__:older")
        .await
        .expect("stale delete"));
    assert!(store
        .delete_if_equals("idempotency:cas", "__in_flight__:newer")
        .await
        .expect("own delete"));
    assert_eq!(store.get("idempotency:cas").await.expect("get"), None);
}

#[tokio::test]
async fn test_publish_reaches_subscriber() {
    let (_container, url) = setup_redis().await;
    let channel = RedisNotificationChannel::connect(&url).await.expect("connect");

    let mut stream = channel.subscribe("order.created").await.expect("subscribe");
    channel
        .publish("order.created", br#"{"id":"1"}"#)
        .await
        .expect("publish");

    let payload = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("message within deadline")
        .expect("stream open")
        .expect("payload");
    assert_eq!(payload, br#"{"id":"1"}"#.to_vec());
}

#[tokio::test]
async fn test_publish_without_subscribers_succeeds() {
    let (_container, url) = setup_redis().await;
    let channel = RedisNotificationChannel::connect(&url).await.expect("connect");

    channel
        .publish("order.created", b"{}")
        .await
        .expect("publish with no receivers is not an error");
}
