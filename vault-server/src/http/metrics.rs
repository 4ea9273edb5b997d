//! Prometheus metrics endpoint.

use crate::pool::Priority;
use crate::server::VaultServer;
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::fmt::Write;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Prometheus metrics handler.
///
/// Gauges describe current state; counters are monotonic since startup.
pub async fn metrics_handler(Extension(server): Extension<Arc<VaultServer>>) -> impl IntoResponse {
    let m = server.metrics();
    let pool = server.pool().stats();
    let activity = server.activity().stats();

    let connections = server.active_connections();
    let sessions = server.auth().sessions().len();
    let dirty = server.storage().dirty_count();
    let amend_slots = server.amend_buffers().len();
    let read_buffers = server.read_buffers().len();
    let tombstones = server.tombstones().len();

    let mut body = format!(
        r#"# HELP strata_vault_connections_active Open protocol connections
# TYPE strata_vault_connections_active gauge
strata_vault_connections_active {connections}

# HELP strata_vault_sessions_active Live sessions
# TYPE strata_vault_sessions_active gauge
strata_vault_sessions_active {sessions}

# HELP strata_vault_info Server information
# TYPE strata_vault_info gauge
strata_vault_info{{version="{version}"}} 1

# HELP strata_vault_connections_total Total connections accepted
# TYPE strata_vault_connections_total counter
strata_vault_connections_total {conns_total}

# HELP strata_vault_requests_total Total requests dispatched
# TYPE strata_vault_requests_total counter
strata_vault_requests_total {requests}

# HELP strata_vault_bytes_received_total Total frame bytes received
# TYPE strata_vault_bytes_received_total counter
strata_vault_bytes_received_total {bytes_rx}

# HELP strata_vault_bytes_sent_total Total frame bytes sent
# TYPE strata_vault_bytes_sent_total counter
strata_vault_bytes_sent_total {bytes_tx}

# HELP strata_vault_rate_limit_hits_total Total rate limit rejections
# TYPE strata_vault_rate_limit_hits_total counter
strata_vault_rate_limit_hits_total {rate_limits}

# HELP strata_vault_errors_total Total fault responses
# TYPE strata_vault_errors_total counter
strata_vault_errors_total {errors}

# HELP strata_vault_trust_refusals_total Connections refused on a trust mismatch
# TYPE strata_vault_trust_refusals_total counter
strata_vault_trust_refusals_total {trust_refusals}

# HELP strata_vault_leases_granted_total Database leases handed out
# TYPE strata_vault_leases_granted_total counter
strata_vault_leases_granted_total {granted}

# HELP strata_vault_leases_refused_total Lease requests refused on timeout or exhaustion
# TYPE strata_vault_leases_refused_total counter
strata_vault_leases_refused_total {refused}

# HELP strata_vault_leases_expired_total Operations rejected on an expired lease
# TYPE strata_vault_leases_expired_total counter
strata_vault_leases_expired_total {expired}

# HELP strata_vault_storage_dirty_entries Usage entries awaiting flush
# TYPE strata_vault_storage_dirty_entries gauge
strata_vault_storage_dirty_entries {dirty}

# HELP strata_vault_amend_slots Open amend slots
# TYPE strata_vault_amend_slots gauge
strata_vault_amend_slots {amend_slots}

# HELP strata_vault_read_buffers Open read cursors (approximate)
# TYPE strata_vault_read_buffers gauge
strata_vault_read_buffers {read_buffers}

# HELP strata_vault_tombstones Recently deleted files remembered (approximate)
# TYPE strata_vault_tombstones gauge
strata_vault_tombstones {tombstones}

# HELP strata_vault_activity_written_total Activity entries persisted
# TYPE strata_vault_activity_written_total counter
strata_vault_activity_written_total {written}

# HELP strata_vault_activity_dropped_total Activity entries given up on
# TYPE strata_vault_activity_dropped_total counter
strata_vault_activity_dropped_total {dropped}
"#,
        version = env!("CARGO_PKG_VERSION"),
        conns_total = m.connections_total.load(Ordering::Relaxed),
        requests = m.requests_total.load(Ordering::Relaxed),
        bytes_rx = m.bytes_received.load(Ordering::Relaxed),
        bytes_tx = m.bytes_sent.load(Ordering::Relaxed),
        rate_limits = m.rate_limit_hits.load(Ordering::Relaxed),
        errors = m.errors_total.load(Ordering::Relaxed),
        trust_refusals = m.trust_refusals.load(Ordering::Relaxed),
        granted = pool.granted.load(Ordering::Relaxed),
        refused = pool.refused.load(Ordering::Relaxed),
        expired = pool.expired.load(Ordering::Relaxed),
        written = activity.written.load(Ordering::Relaxed),
        dropped = activity.dropped.load(Ordering::Relaxed),
    );

    body.push_str("\n# HELP strata_vault_leases_available Free lease slots per tier\n");
    body.push_str("# TYPE strata_vault_leases_available gauge\n");
    for tier in [Priority::High, Priority::Normal, Priority::Low] {
        let _ = writeln!(
            body,
            "strata_vault_leases_available{{tier=\"{}\"}} {}",
            tier.as_str(),
            server.pool().available(tier)
        );
    }

    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
