//! Shared handler state.

use metrics_exporter_prometheus::PrometheusHandle;
use outbox_runtime::OrderService;
use std::sync::Arc;

/// State shared by every handler.
pub struct AppState<D, K> {
    /// The write path
    pub orders: Arc<OrderService<D, K>>,
    /// Prometheus render handle, absent when no recorder was installed
    pub metrics: Option<PrometheusHandle>,
}

impl<D, K> AppState<D, K> {
    /// Create state around an order service.
    #[must_use]
    pub fn new(orders: OrderService<D, K>, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            orders: Arc::new(orders),
            metrics,
        }
    }
}

impl<D, K> Clone for AppState<D, K> {
    fn clone(&self) -> Self {
        Self {
            orders: Arc::clone(&self.orders),
            metrics: self.metrics.clone(),
        }
    }
}
