//! `/health`: liveness plus enough state for a load balancer to stop
//! routing to a draining or starved node.

use crate::pool::Priority;
use crate::server::VaultServer;
use axum::{http::StatusCode, Extension, Json};
use serde::Serialize;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

static STARTED: OnceLock<Instant> = OnceLock::new();

/// Record the process start. Later calls keep the first instant.
pub fn init_start_time() {
    STARTED.get_or_init(Instant::now);
}

fn uptime_seconds() -> u64 {
    STARTED.get().map_or(0, |at| at.elapsed().as_secs())
}

/// Body of a `/health` reply.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// `ok`, `degraded` (no free high-priority lease) or `draining`.
    pub status: &'static str,
    /// Crate version.
    pub version: &'static str,
    /// Open protocol connections.
    pub connections: usize,
    /// Live sessions.
    pub sessions: usize,
    /// Whether the listener requires TLS.
    pub tls: bool,
    /// Seconds since [`init_start_time`].
    pub uptime_seconds: u64,
}

impl HealthStatus {
    fn http_status(&self) -> StatusCode {
        match self.status {
            "draining" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::OK,
        }
    }
}

/// Report health. Draining nodes answer 503.
pub async fn health_handler(
    Extension(server): Extension<Arc<VaultServer>>,
) -> (StatusCode, Json<HealthStatus>) {
    let status = if server.coordinator().is_shutting_down() {
        "draining"
    } else if server.pool().available(Priority::High) == 0 {
        "degraded"
    } else {
        "ok"
    };
    let health = HealthStatus {
        status,
        version: env!("CARGO_PKG_VERSION"),
        connections: server.active_connections(),
        sessions: server.auth().sessions().len(),
        tls: server.config().tls.enabled,
        uptime_seconds: uptime_seconds(),
    };
    (health.http_status(), Json(health))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draining_maps_to_unavailable() {
        let mut health = HealthStatus {
            status: "ok",
            version: "0.1.0",
            connections: 3,
            sessions: 2,
            tls: false,
            uptime_seconds: 60,
        };
        assert_eq!(health.http_status(), StatusCode::OK);
        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["sessions"], 2);

        health.status = "draining";
        assert_eq!(health.http_status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
