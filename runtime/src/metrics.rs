//! Prometheus metrics for the write path and the relay.
//!
//! Components record through the static recorders below ([`OrderMetrics`],
//! [`RelayMetrics`], [`StartupMetrics`]). Without an installed recorder the
//! `metrics` macros are no-ops, so library users and tests pay nothing.
//!
//! # Example
//!
//! ```rust,no_run
//! use outbox_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:8080".parse()?);
//! server.start()?;
//!
//! // Render for a `/metrics` handler
//! let body = server.render().unwrap_or_default();
//! # Ok(())
//! # }
//! ```

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use outbox_core::error::{RelayError, WriteStage};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder with a render handle.
///
/// The exposition endpoint itself is served by the caller's HTTP router.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a metrics server for the given advertised address.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Register metric descriptions and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    /// A recorder that is already installed (as in tests) is not an error.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .set_buckets_for_metric(
                Matcher::Full("relay_batch_size".to_string()),
                &[0.0, 1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics available at http://{}/metrics", self.addr);
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Write path
    describe_counter!("orders_created_total", "Orders committed together with their outbox event");
    describe_counter!(
        "orders_replayed_total",
        "Requests answered from the idempotency cache"
    );
    describe_counter!(
        "orders_rejected_in_flight_total",
        "Requests rejected because the same token was in flight"
    );
    describe_counter!(
        "orders_write_failures_total",
        "Failed order writes, labelled by the stage that failed"
    );
    describe_histogram!(
        "order_write_duration_seconds",
        "Time taken by the transactional order write"
    );

    // Relay
    describe_counter!("relay_batches_total", "Relay batches committed");
    describe_counter!(
        "relay_events_published_total",
        "Outbox events published and marked processed"
    );
    describe_counter!(
        "relay_batch_aborts_total",
        "Relay batches rolled back, labelled by reason"
    );
    describe_histogram!("relay_batch_duration_seconds", "Time taken by one relay batch");
    describe_histogram!("relay_batch_size", "Rows claimed per relay batch");

    // Startup
    describe_counter!(
        "startup_connect_attempts_total",
        "Connection attempts made while starting up"
    );
}

/// Write path metrics recorder.
pub struct OrderMetrics;

impl OrderMetrics {
    /// Record a committed order.
    pub fn record_created(duration: Duration) {
        counter!("orders_created_total").increment(1);
        histogram!("order_write_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a response replayed from the cache.
    pub fn record_replayed() {
        counter!("orders_replayed_total").increment(1);
    }

    /// Record a request rejected by the in-flight lock.
    pub fn record_rejected_in_flight() {
        counter!("orders_rejected_in_flight_total").increment(1);
    }

    /// Record a failed write.
    pub fn record_write_failure(stage: WriteStage) {
        counter!("orders_write_failures_total", "stage" => stage.as_str()).increment(1);
    }
}

/// Relay metrics recorder.
pub struct RelayMetrics;

impl RelayMetrics {
    /// Record a committed batch.
    pub fn record_batch(published: usize, duration: Duration) {
        counter!("relay_batches_total").increment(1);
        counter!("relay_events_published_total").increment(published as u64);
        histogram!("relay_batch_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record the number of rows claimed by a batch.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_claimed(claimed: usize) {
        histogram!("relay_batch_size").record(claimed as f64);
    }

    /// Record a rolled back batch.
    pub fn record_abort(error: &RelayError) {
        counter!("relay_batch_aborts_total", "reason" => error.reason()).increment(1);
    }
}

/// Startup metrics recorder.
pub struct StartupMetrics;

impl StartupMetrics {
    /// Record a connection attempt.
    pub fn record_connect_attempt(target: &'static str) {
        counter!("startup_connect_attempts_total", "target" => target).increment(1);
    }
}
