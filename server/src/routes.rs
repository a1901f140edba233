//! HTTP routes.
//!
//! - `POST /orders`: create an order, idempotent per `Idempotency-Key` header
//! - `GET /orders/:id`: read a committed order
//! - `GET /health`: liveness
//! - `GET /metrics`: Prometheus exposition

use crate::error::AppError;
use crate::state::AppState;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use outbox_core::idempotency::{IdempotencyStore, IdempotencyToken};
use outbox_core::order::{OrderId, UserId};
use outbox_core::store::DurableStore;
use outbox_runtime::{CreateOrderOutcome, NewOrder, OrderReceipt};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

/// Request header carrying the client's idempotency token.
pub const IDEMPOTENCY_KEY: &str = "idempotency-key";

/// Response header set on replayed responses.
pub const IDEMPOTENT_REPLAYED: &str = "idempotent-replayed";

/// Amount used when the request body does not carry one.
pub const DEFAULT_AMOUNT: i64 = 1000;

/// Optional body of `POST /orders`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateOrderRequest {
    /// Ordering user; a fresh id when absent
    pub user_id: Option<UserId>,
    /// Amount in minor units; [`DEFAULT_AMOUNT`] when absent
    pub amount: Option<i64>,
}

impl CreateOrderRequest {
    fn parse(body: &[u8]) -> Result<Self, AppError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(body)
            .map_err(|e| AppError::bad_request(format!("Invalid request body: {e}")))
    }

    fn into_new_order(self) -> Result<NewOrder, AppError> {
        let amount = self.amount.unwrap_or(DEFAULT_AMOUNT);
        if amount <= 0 {
            return Err(AppError::validation("amount must be greater than zero"));
        }
        Ok(NewOrder {
            user_id: self.user_id.unwrap_or_default(),
            amount,
        })
    }
}

fn idempotency_token(headers: &HeaderMap) -> Result<IdempotencyToken, AppError> {
    let raw = headers
        .get(IDEMPOTENCY_KEY)
        .ok_or_else(|| AppError::bad_request("Idempotency-Key header is required"))?
        .to_str()
        .map_err(|_| AppError::bad_request("Idempotency-Key header must be ASCII"))?;

    raw.parse()
        .map_err(|e| AppError::bad_request(format!("Invalid Idempotency-Key: {e}")))
}

/// Build the router.
pub fn build_router<D, K>(state: AppState<D, K>) -> Router
where
    D: DurableStore + 'static,
    K: IdempotencyStore + 'static,
{
    Router::new()
        .route("/orders", post(create_order::<D, K>))
        .route("/orders/:id", get(get_order::<D, K>))
        .route("/health", get(health))
        .route("/metrics", get(render_metrics::<D, K>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `POST /orders`
///
/// # Errors
///
/// See [`AppError`]'s conversion from `CreateOrderError`; a missing or
/// invalid `Idempotency-Key` or body is a 400, a non-positive amount a 422.
pub async fn create_order<D, K>(
    State(state): State<AppState<D, K>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError>
where
    D: DurableStore + 'static,
    K: IdempotencyStore + 'static,
{
    let token = idempotency_token(&headers)?;
    let new_order = CreateOrderRequest::parse(&body)?.into_new_order()?;

    let outcome = state.orders.create_order(&token, new_order).await?;

    let mut response = (StatusCode::CREATED, Json(*outcome.receipt())).into_response();
    if let CreateOrderOutcome::Replayed(_) = outcome {
        response
            .headers_mut()
            .insert(
                HeaderName::from_static(IDEMPOTENT_REPLAYED),
                HeaderValue::from_static("true"),
            );
    }
    Ok(response)
}

/// `GET /orders/:id`
///
/// # Errors
///
/// 400 for a malformed id, 404 for an unknown one, 503 if the store is down.
pub async fn get_order<D, K>(
    State(state): State<AppState<D, K>>,
    Path(id): Path<String>,
) -> Result<Json<OrderReceipt>, AppError>
where
    D: DurableStore + 'static,
    K: IdempotencyStore + 'static,
{
    let order_id: OrderId = id
        .parse()
        .map_err(|e| AppError::bad_request(format!("Invalid order id: {e}")))?;

    let order = state
        .orders
        .store()
        .find_order(order_id)
        .await?
        .ok_or_else(|| AppError::not_found("Order", order_id))?;

    Ok(Json(OrderReceipt::from(&order)))
}

async fn health() -> &'static str {
    "OK"
}

async fn render_metrics<D, K>(State(state): State<AppState<D, K>>) -> Response
where
    D: DurableStore + 'static,
    K: IdempotencyStore + 'static,
{
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
