//! Two-phase graceful shutdown.
//!
//! Phase one cancels the connection token: the accept loop stops and each
//! connection finishes its current request, then closes. Phase two cancels
//! the background token: background tasks leave their periodic loops and
//! run one final drain-and-flush pass. Each phase waits on its task tracker
//! up to the drain timeout.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Outcome of [`ShutdownCoordinator::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// All connections closed within the drain timeout.
    pub connections_drained: bool,
    /// All background tasks finished their final flush within the drain timeout.
    pub background_drained: bool,
}

impl ShutdownReport {
    /// Whether both phases completed in time.
    pub fn is_clean(&self) -> bool {
        self.connections_drained && self.background_drained
    }
}

/// Broadcasts cancellation and tracks the tasks that must drain.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    connections: CancellationToken,
    background: CancellationToken,
    connection_tasks: TaskTracker,
    background_tasks: TaskTracker,
    drain_timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create a coordinator with the given per-phase drain timeout.
    pub fn new(drain_timeout: Duration) -> Self {
        Self {
            connections: CancellationToken::new(),
            background: CancellationToken::new(),
            connection_tasks: TaskTracker::new(),
            background_tasks: TaskTracker::new(),
            drain_timeout,
        }
    }

    /// Token cancelled when connections must wind down.
    pub fn connection_token(&self) -> CancellationToken {
        self.connections.clone()
    }

    /// Token cancelled when background tasks must drain and flush.
    pub fn background_token(&self) -> CancellationToken {
        self.background.clone()
    }

    /// Spawn a tracked connection task.
    pub fn spawn_connection<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.connection_tasks.spawn(task)
    }

    /// Spawn a tracked background task.
    pub fn spawn_background<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.background_tasks.spawn(task)
    }

    /// Number of connection tasks still running.
    pub fn active_connections(&self) -> usize {
        self.connection_tasks.len()
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.connections.is_cancelled()
    }

    /// Run both phases. Safe to call more than once.
    pub async fn shutdown(&self) -> ShutdownReport {
        tracing::info!(
            "Shutting down: draining {} connections",
            self.active_connections()
        );
        self.connections.cancel();
        self.connection_tasks.close();
        let connections_drained =
            tokio::time::timeout(self.drain_timeout, self.connection_tasks.wait())
                .await
                .is_ok();
        if !connections_drained {
            tracing::warn!(
                "{} connections still open after {:?}",
                self.active_connections(),
                self.drain_timeout
            );
        }

        self.background.cancel();
        self.background_tasks.close();
        let background_drained =
            tokio::time::timeout(self.drain_timeout, self.background_tasks.wait())
                .await
                .is_ok();
        if !background_drained {
            tracing::error!("Background tasks did not finish their final flush in time");
        }

        ShutdownReport {
            connections_drained,
            background_drained,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn background_runs_after_connections() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let connection_done = Arc::new(AtomicBool::new(false));
        let flush_saw_connection_done = Arc::new(AtomicBool::new(false));

        let token = coordinator.connection_token();
        let done = connection_done.clone();
        coordinator.spawn_connection(async move {
            token.cancelled().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            done.store(true, Ordering::SeqCst);
        });

        let token = coordinator.background_token();
        let done = connection_done.clone();
        let saw = flush_saw_connection_done.clone();
        coordinator.spawn_background(async move {
            token.cancelled().await;
            saw.store(done.load(Ordering::SeqCst), Ordering::SeqCst);
        });

        let report = coordinator.shutdown().await;
        assert!(report.is_clean());
        assert!(flush_saw_connection_done.load(Ordering::SeqCst));
        assert_eq!(coordinator.active_connections(), 0);
    }

    #[tokio::test]
    async fn stuck_connection_times_out() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(20));
        coordinator.spawn_connection(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        let report = coordinator.shutdown().await;
        assert!(!report.connections_drained);
        assert!(report.background_drained);
        assert!(coordinator.is_shutting_down());
    }
}
