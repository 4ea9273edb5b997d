//! HTTP endpoints for strata-vault.
//!
//! A small side server for operators: health checks and Prometheus
//! metrics. It never serves file contents.

pub mod health;
mod metrics;

use crate::server::VaultServer;
use axum::{routing::get, Extension, Router};
use std::sync::Arc;

pub use health::HealthStatus;

/// Build the HTTP router. `/metrics` is only mounted when enabled.
pub fn build_router(server: Arc<VaultServer>) -> Router {
    let mut router = Router::new().route("/health", get(health::health_handler));
    if server.config().http.metrics_enabled {
        router = router.route("/metrics", get(metrics::metrics_handler));
    }
    router.layer(Extension(server))
}
