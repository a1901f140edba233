//! HTTP API tests over in-memory collaborators.
#![allow(clippy::unwrap_used)]

use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum_test::TestServer;
use outbox_core::idempotency::{IN_FLIGHT_MARKER, IdempotencyError, IdempotencyStore};
use outbox_core::outbox::{ORDER_CREATED, OutboxStatus};
use outbox_core::store::StoreError;
use outbox_runtime::{
    GuardConfig, IdempotencyGuard, OrderReceipt, OrderService, TransactionalWriter, WriterConfig,
};
use outbox_server::routes::{DEFAULT_AMOUNT, IDEMPOTENCY_KEY, IDEMPOTENT_REPLAYED};
use outbox_server::{AppState, build_router};
use outbox_testing::{InMemoryIdempotencyStore, InMemoryStore, StoreOp};
use serde_json::{Value, json};
use std::time::Duration;

struct Harness {
    server: TestServer,
    store: InMemoryStore,
    keys: InMemoryIdempotencyStore,
}

fn harness() -> Harness {
    let store = InMemoryStore::new();
    let keys = InMemoryIdempotencyStore::new();
    let service = OrderService::new(
        IdempotencyGuard::new(keys.clone(), GuardConfig::default()),
        TransactionalWriter::new(store.clone(), WriterConfig::default()),
    );
    let server = TestServer::new(build_router(AppState::new(service, None))).unwrap();
    Harness {
        server,
        store,
        keys,
    }
}

fn key_header(token: &str) -> (HeaderName, HeaderValue) {
    (
        HeaderName::from_static(IDEMPOTENCY_KEY),
        HeaderValue::from_str(token).unwrap(),
    )
}

#[tokio::test]
async fn create_order_returns_201_with_receipt() {
    let h = harness();
    let (name, value) = key_header("test-order-1");

    let response = h.server.post("/orders").add_header(name, value).await;

    assert_eq!(response.status_code(), StatusCode::CREATED);
    let receipt: OrderReceipt = response.json();
    assert_eq!(receipt.amount, DEFAULT_AMOUNT);
    assert!(response.headers().get(IDEMPOTENT_REPLAYED).is_none());

    let outbox = h.store.outbox_for_order(receipt.order_id);
    assert_eq!(outbox.len(), 1);
    assert_eq!(outbox[0].event_type, ORDER_CREATED);
    assert_eq!(outbox[0].status, OutboxStatus::Pending);
}

#[tokio::test]
async fn retried_request_replays_identical_body() {
    let h = harness();
    let body = json!({ "amount": 4200 });

    let (name, value) = key_header("checkout-42");
    let first = h
        .server
        .post("/orders")
        .add_header(name, value)
        .json(&body)
        .await;
    let (name, value) = key_header("checkout-42");
    let second = h
        .server
        .post("/orders")
        .add_header(name, value)
        .json(&body)
        .await;

    assert_eq!(first.status_code(), StatusCode::CREATED);
    assert_eq!(second.status_code(), StatusCode::CREATED);
    assert_eq!(first.json::<Value>(), second.json::<Value>());
    assert_eq!(
        second.headers().get(IDEMPOTENT_REPLAYED).unwrap(),
        &HeaderValue::from_static("true")
    );
    assert_eq!(h.store.orders().len(), 1);
    assert_eq!(h.store.outbox().len(), 1);
}

#[tokio::test]
async fn resubmitted_t1_returns_the_same_order_without_a_new_row() {
    let h = harness();
    let body = json!({ "amount": 1000 });

    let (name, value) = key_header("t1");
    let first = h
        .server
        .post("/orders")
        .add_header(name, value)
        .json(&body)
        .await;
    assert_eq!(first.status_code(), StatusCode::CREATED);
    let created: OrderReceipt = first.json();
    assert_eq!(created.amount, 1000);
    assert_eq!(h.store.orders().len(), 1);

    let (name, value) = key_header("t1");
    let again = h
        .server
        .post("/orders")
        .add_header(name, value)
        .json(&body)
        .await;

    assert_eq!(again.status_code(), StatusCode::CREATED);
    assert_eq!(again.text(), first.text());
    assert_eq!(again.json::<OrderReceipt>().order_id, created.order_id);
    assert_eq!(h.store.orders().len(), 1);
    assert_eq!(h.store.calls(StoreOp::InsertOrder), 1);
}

#[tokio::test]
async fn missing_idempotency_key_is_rejected() {
    let h = harness();

    let response = h.server.post("/orders").await;

    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    assert!(h.store.orders().is_empty());
}

#[tokio::test]
async fn non_positive_amount_is_unprocessable() {
    let h = harness();
    let (name, value) = key_header("zero");

    let response = h
        .server
        .post("/orders")
        .add_header(name, value)
        .json(&json!({ "amount": 0 }))
        .await;

    assert_eq!(response.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(h.store.calls(StoreOp::Begin), 0);
}

#[tokio::test]
async fn in_flight_token_returns_409_with_retry_after() {
    let h = harness();
    let guard_key = format!("{}busy", GuardConfig::default().key_prefix);
    h.keys
        .set_if_absent(&guard_key, IN_FLIGHT_MARKER, Duration::from_secs(30))
        .await
        .unwrap();
    let (name, value) = key_header("busy");

    let response = h.server.post("/orders").add_header(name, value).await;

    assert_eq!(response.status_code(), StatusCode::CONFLICT);
    assert!(response.headers().get("retry-after").is_some());
    assert!(h.store.orders().is_empty());
}

#[tokio::test]
async fn store_outage_is_503_and_releases_the_token() {
    let h = harness();
    h.store
        .fail_once(StoreOp::Begin, StoreError::Unavailable("connection refused".into()));

    let (name, value) = key_header("outage");
    let failed = h.server.post("/orders").add_header(name, value).await;
    assert_eq!(failed.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(h.store.orders().is_empty());

    let (name, value) = key_header("outage");
    let retried = h.server.post("/orders").add_header(name, value).await;
    assert_eq!(retried.status_code(), StatusCode::CREATED);
    assert_eq!(h.store.orders().len(), 1);
}

#[tokio::test]
async fn idempotency_outage_is_503() {
    let h = harness();
    h.keys
        .set_failure(Some(IdempotencyError::Unavailable("down".into())));
    let (name, value) = key_header("no-redis");

    let response = h.server.post("/orders").add_header(name, value).await;

    assert_eq!(response.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(h.store.orders().is_empty());
}

#[tokio::test]
async fn get_order_round_trips_through_the_store() {
    let h = harness();
    let (name, value) = key_header("lookup");
    let created: OrderReceipt = h
        .server
        .post("/orders")
        .add_header(name, value)
        .await
        .json();

    let found = h.server.get(&format!("/orders/{}", created.order_id)).await;
    assert_eq!(found.status_code(), StatusCode::OK);
    assert_eq!(found.json::<OrderReceipt>(), created);

    let missing = h
        .server
        .get("/orders/00000000-0000-0000-0000-000000000000")
        .await;
    assert_eq!(missing.status_code(), StatusCode::NOT_FOUND);

    let malformed = h.server.get("/orders/not-a-uuid").await;
    assert_eq!(malformed.status_code(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn health_is_ok_and_metrics_absent_without_recorder() {
    let h = harness();

    let health = h.server.get("/health").await;
    assert_eq!(health.status_code(), StatusCode::OK);
    assert_eq!(health.text(), "OK");

    let metrics = h.server.get("/metrics").await;
    assert_eq!(metrics.status_code(), StatusCode::NOT_FOUND);
}
