//! # Outbox Server
//!
//! HTTP front end and process wiring for the transactional outbox engine.
//!
//! - [`routes`]: `POST /orders`, `GET /orders/:id`, `/health`, `/metrics`
//! - [`lifecycle`]: connects the backing stores, spawns the relay workers and
//!   the confirmation subscriber, serves HTTP and shuts everything down
//! - [`subscriber`]: the downstream consumer of `order.created`
//! - [`config`]: environment configuration
//!
//! The router is generic over the durable and idempotency stores, so the
//! whole HTTP surface runs against the in-memory collaborators in tests.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod routes;
pub mod state;
pub mod subscriber;
pub mod telemetry;

pub use config::Config;
pub use error::AppError;
pub use routes::build_router;
pub use state::AppState;
