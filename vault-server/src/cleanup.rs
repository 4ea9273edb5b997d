//! Background sweep task.
//!
//! Runs periodically to drop state that has outlived its use: expired
//! sessions and replay records, sessions of users banned since login,
//! expired grants, idle amend slots, expired buffers and tombstones, and
//! rate limiter keys that have fully recharged.

use crate::pool::Priority;
use crate::server::VaultServer;
use crate::storage::grants;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

/// What one sweep removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Expired sessions.
    pub sessions: usize,
    /// Forgotten superseded-token and digest records.
    pub superseded: usize,
    /// Sessions ended because their user is banned.
    pub banned: usize,
    /// Expired grant rows deleted.
    pub grants: u64,
    /// Idle amend slots dropped.
    pub amend_slots: usize,
}

impl SweepReport {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Run one sweep. Store failures are logged and skipped so one bad pass
/// does not stop the others.
pub async fn sweep(server: &VaultServer) -> SweepReport {
    let stats = server.auth().sessions().sweep();
    let mut report = SweepReport {
        sessions: stats.sessions,
        superseded: stats.superseded,
        ..SweepReport::default()
    };

    match server.auth().enforce_bans().await {
        Ok(n) => report.banned = n,
        Err(e) => tracing::error!("Cleanup: ban enforcement failed: {}", e),
    }

    match purge_grants(server).await {
        Ok(n) => report.grants = n,
        Err(e) => tracing::error!("Cleanup: grant purge failed: {}", e),
    }

    report.amend_slots = server.amend_buffers().sweep_idle();
    server.read_buffers().run_pending_tasks();
    server.tombstones().run_pending_tasks();
    server.rate_limits().shrink();
    report
}

async fn purge_grants(server: &VaultServer) -> crate::pool::PoolResult<u64> {
    let mut lease = server.pool().lease(Priority::Low).await?;
    let purged = grants::purge_expired(&mut lease).await?;
    lease.commit().await?;
    Ok(purged)
}

/// Spawn the sweep task on the server's background tracker. It stops when
/// shutdown reaches the background phase.
pub fn spawn_cleanup_task(server: Arc<VaultServer>) {
    let config = server.config().cleanup.clone();
    if !config.enabled {
        tracing::info!("Cleanup task disabled");
        return;
    }

    let cancel = server.coordinator().background_token();
    let task_server = server.clone();
    server.coordinator().spawn_background(async move {
        let interval_secs = config.interval_secs.max(1);
        tracing::info!("Cleanup task started (interval: {}s)", interval_secs);
        let mut timer = interval(Duration::from_secs(interval_secs));
        // The first tick fires immediately; skip it so startup is quiet.
        timer.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {
                    let report = sweep(&task_server).await;
                    if report.is_empty() {
                        tracing::debug!("Cleanup: nothing to remove");
                    } else {
                        tracing::info!("Cleanup: {:?}", report);
                    }
                }
            }
        }
        tracing::debug!("Cleanup task stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Priority;
    use crate::server::tests::{test_config, test_server};
    use crate::storage::{files, users};
    use vault_types::Role;

    #[tokio::test]
    async fn sweep_purges_expired_grants() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(&dir).await;

        let mut lease = server.pool().lease(Priority::High).await.unwrap();
        users::insert(&mut lease, "alice", "hash").await.unwrap();
        users::insert(&mut lease, "bob", "hash").await.unwrap();
        files::insert(&mut lease, "alice", "a.txt", 0).await.unwrap();
        grants::upsert(&mut lease, "alice", "a.txt", "bob", Role::Reader, "alice", Some(1))
            .await
            .unwrap();
        lease.commit().await.unwrap();

        let report = sweep(&server).await;
        assert_eq!(report.grants, 1);
        assert!(!report.is_empty());
        assert!(sweep(&server).await.is_empty());
    }

    #[tokio::test]
    async fn sweep_ends_sessions_of_banned_users() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(&dir).await;
        server.auth().register("alice", "password1").await.unwrap();
        server.auth().authenticate("alice", "password1").await.unwrap();

        // Ban written behind the manager's back, as an operator tool would.
        let mut lease = server.pool().lease(Priority::High).await.unwrap();
        crate::storage::bans::insert(&mut lease, "alice", "abuse", None)
            .await
            .unwrap();
        lease.commit().await.unwrap();

        let report = sweep(&server).await;
        assert_eq!(report.banned, 1);
        assert!(server.auth().sessions().is_empty());
    }

    #[tokio::test]
    async fn disabled_task_is_not_spawned() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.cleanup.enabled = false;
        let db = crate::storage::connect_in_memory().await.unwrap();
        let server = VaultServer::start(config, db).await.unwrap();
        let report = server.shutdown().await;
        assert!(report.is_clean());
    }
}
