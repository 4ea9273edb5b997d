//! Activity log persistence pipeline.
//!
//! Producers call [`ActivityLogger::log`], which pushes onto an unbounded
//! channel and never blocks. A single [`ActivityWriter`] drains the channel
//! into batches and writes them at [`Priority::Low`], retrying with
//! exponential backoff. Batches that exhaust their retries are dropped and
//! counted.
//!
//! When the background token is cancelled the writer stops batching,
//! drains whatever is queued and makes one final write at
//! [`Priority::High`].

use crate::config::ActivityConfig;
use crate::pool::{LeasePool, PoolError, Priority};
use crate::storage;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Longest stored detail string, in characters.
pub const MAX_DETAILS_LEN: usize = 512;

/// Component that recorded an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogAuthor {
    /// Accept loop and lifecycle.
    Server,
    /// Request dispatch.
    Dispatcher,
    /// Session and account management.
    Auth,
    /// Certificate trust decisions.
    Trust,
    /// Background sweeper.
    Cleanup,
    /// Operator commands.
    Admin,
}

impl LogAuthor {
    /// Stored name.
    pub fn as_str(self) -> &'static str {
        match self {
            LogAuthor::Server => "server",
            LogAuthor::Dispatcher => "dispatcher",
            LogAuthor::Auth => "auth",
            LogAuthor::Trust => "trust",
            LogAuthor::Cleanup => "cleanup",
            LogAuthor::Admin => "admin",
        }
    }
}

/// What an entry is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogCategory {
    /// Logins, refreshes and logouts.
    Session,
    /// Account creation, deletion, password and ban changes.
    Account,
    /// File content and lifecycle.
    File,
    /// Grants, visibility and ownership.
    Permission,
    /// Replays, trust mismatches and other suspicious events.
    Security,
    /// Process lifecycle.
    Lifecycle,
}

impl LogCategory {
    /// Stored name.
    pub fn as_str(self) -> &'static str {
        match self {
            LogCategory::Session => "session",
            LogCategory::Account => "account",
            LogCategory::File => "file",
            LogCategory::Permission => "permission",
            LogCategory::Security => "security",
            LogCategory::Lifecycle => "lifecycle",
        }
    }
}

/// One append-only log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityEntry {
    /// Event time (Unix seconds).
    pub occurred_at: i64,
    /// Severity, clamped to 1..=5.
    pub severity: u8,
    /// Recording component.
    pub logged_by: LogAuthor,
    /// Event category.
    pub category: LogCategory,
    /// Details, truncated to [`MAX_DETAILS_LEN`] characters.
    pub details: String,
    /// Related user.
    pub user_concerned: Option<String>,
    /// Related host.
    pub host_concerned: Option<String>,
}

impl ActivityEntry {
    /// Build an entry stamped with the current time.
    pub fn new(severity: u8, logged_by: LogAuthor, category: LogCategory, details: impl Into<String>) -> Self {
        let mut details = details.into();
        if let Some((cut, _)) = details.char_indices().nth(MAX_DETAILS_LEN) {
            details.truncate(cut);
        }
        Self {
            occurred_at: storage::unix_now(),
            severity: severity.clamp(1, 5),
            logged_by,
            category,
            details,
            user_concerned: None,
            host_concerned: None,
        }
    }

    /// Attach the user the entry concerns.
    pub fn user(mut self, username: impl Into<String>) -> Self {
        self.user_concerned = Some(username.into());
        self
    }

    /// Attach the host the entry concerns.
    pub fn host(mut self, host: impl ToString) -> Self {
        self.host_concerned = Some(host.to_string());
        self
    }
}

/// Destination for activity batches.
#[async_trait]
pub trait ActivitySink: Send + Sync {
    /// Write a whole batch atomically.
    async fn write(&self, entries: &[ActivityEntry], priority: Priority) -> Result<u64, PoolError>;
}

/// Writes batches into `activity_logs` through the lease pool.
pub struct SqliteSink {
    pool: Arc<LeasePool>,
}

impl SqliteSink {
    /// Create a sink over the lease pool.
    pub fn new(pool: Arc<LeasePool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ActivitySink for SqliteSink {
    async fn write(&self, entries: &[ActivityEntry], priority: Priority) -> Result<u64, PoolError> {
        let mut lease = self.pool.lease(priority).await?;
        let written = storage::activity::insert_batch(&mut lease, entries).await?;
        lease.commit().await?;
        Ok(written)
    }
}

/// Pipeline counters.
#[derive(Debug, Default)]
pub struct ActivityStats {
    /// Entries accepted from producers.
    pub enqueued: AtomicU64,
    /// Entries durably written.
    pub written: AtomicU64,
    /// Entries given up on.
    pub dropped: AtomicU64,
    /// Failed write attempts.
    pub failed_attempts: AtomicU64,
}

/// Producer handle. Cheap to clone.
#[derive(Clone)]
pub struct ActivityLogger {
    tx: mpsc::UnboundedSender<ActivityEntry>,
    stats: Arc<ActivityStats>,
}

impl std::fmt::Debug for ActivityLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityLogger")
            .field("enqueued", &self.stats.enqueued.load(Ordering::Relaxed))
            .field("written", &self.stats.written.load(Ordering::Relaxed))
            .field("dropped", &self.stats.dropped.load(Ordering::Relaxed))
            .finish()
    }
}

impl ActivityLogger {
    /// Create a logger and the writer that consumes it.
    pub fn new(sink: Arc<dyn ActivitySink>, config: &ActivityConfig) -> (Self, ActivityWriter) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(ActivityStats::default());
        let writer = ActivityWriter {
            rx,
            sink,
            stats: stats.clone(),
            batch_size: config.batch_size.max(1),
            flush_interval: Duration::from_secs(config.flush_interval_secs.max(1)),
            max_retries: config.max_retries,
            retry_base: Duration::from_millis(config.retry_base_ms),
        };
        (Self { tx, stats }, writer)
    }

    /// Queue an entry. Never blocks; entries logged after the writer has
    /// stopped are counted as dropped.
    pub fn log(&self, entry: ActivityEntry) {
        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(entry).is_err() {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Pipeline counters.
    pub fn stats(&self) -> &ActivityStats {
        &self.stats
    }
}

/// Single consumer of the activity queue.
pub struct ActivityWriter {
    rx: mpsc::UnboundedReceiver<ActivityEntry>,
    sink: Arc<dyn ActivitySink>,
    stats: Arc<ActivityStats>,
    batch_size: usize,
    flush_interval: Duration,
    max_retries: u32,
    retry_base: Duration,
}

impl ActivityWriter {
    /// Batch and write until cancelled, then drain and flush once.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut batch = Vec::with_capacity(self.batch_size);
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                received = self.rx.recv() => match received {
                    Some(entry) => {
                        batch.push(entry);
                        if batch.len() >= self.batch_size {
                            self.write_with_retry(&mut batch, &cancel).await;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        self.write_with_retry(&mut batch, &cancel).await;
                    }
                }
            }
        }

        self.rx.close();
        while let Ok(entry) = self.rx.try_recv() {
            batch.push(entry);
        }
        self.final_write(batch).await;
    }

    /// Write at low priority. Leaves the batch intact if cancelled mid-retry
    /// so the final write picks it up.
    async fn write_with_retry(&self, batch: &mut Vec<ActivityEntry>, cancel: &CancellationToken) {
        let mut attempt = 0;
        loop {
            match self.sink.write(batch, Priority::Low).await {
                Ok(written) => {
                    self.stats.written.fetch_add(written, Ordering::Relaxed);
                    batch.clear();
                    return;
                }
                Err(e) => {
                    self.stats.failed_attempts.fetch_add(1, Ordering::Relaxed);
                    if attempt >= self.max_retries {
                        tracing::error!(
                            "Dropping {} activity entries after {} attempts: {}",
                            batch.len(),
                            attempt + 1,
                            e
                        );
                        self.stats.dropped.fetch_add(batch.len() as u64, Ordering::Relaxed);
                        batch.clear();
                        return;
                    }
                    let backoff = self.retry_base * 2u32.saturating_pow(attempt.min(16));
                    tracing::warn!("Activity write failed (attempt {}): {}", attempt + 1, e);
                    attempt += 1;
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }

    async fn final_write(&self, batch: Vec<ActivityEntry>) {
        if batch.is_empty() {
            return;
        }
        match self.sink.write(&batch, Priority::High).await {
            Ok(written) => {
                self.stats.written.fetch_add(written, Ordering::Relaxed);
                tracing::info!("Flushed {} activity entries on shutdown", written);
            }
            Err(e) => {
                self.stats.failed_attempts.fetch_add(1, Ordering::Relaxed);
                self.stats.dropped.fetch_add(batch.len() as u64, Ordering::Relaxed);
                tracing::error!("Lost {} activity entries on shutdown: {}", batch.len(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use std::sync::Mutex;

    /// Fails the first `failures` writes, then records batches.
    struct FlakySink {
        failures: AtomicU64,
        batches: Mutex<Vec<(usize, Priority)>>,
    }

    impl FlakySink {
        fn new(failures: u64) -> Arc<Self> {
            Arc::new(Self {
                failures: AtomicU64::new(failures),
                batches: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ActivitySink for FlakySink {
        async fn write(&self, entries: &[ActivityEntry], priority: Priority) -> Result<u64, PoolError> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(PoolError::Timeout("low"));
            }
            self.batches.lock().unwrap().push((entries.len(), priority));
            Ok(entries.len() as u64)
        }
    }

    fn config(batch_size: usize, max_retries: u32) -> ActivityConfig {
        ActivityConfig {
            batch_size,
            flush_interval_secs: 3600,
            max_retries,
            retry_base_ms: 1,
        }
    }

    fn entry(n: usize) -> ActivityEntry {
        ActivityEntry::new(2, LogAuthor::Server, LogCategory::Lifecycle, format!("event {n}"))
    }

    #[test]
    fn entry_is_clamped_and_truncated() {
        let e = ActivityEntry::new(9, LogAuthor::Auth, LogCategory::Security, "é".repeat(600));
        assert_eq!(e.severity, 5);
        assert_eq!(e.details.chars().count(), MAX_DETAILS_LEN);
        assert_eq!(ActivityEntry::new(0, LogAuthor::Auth, LogCategory::Security, "").severity, 1);
    }

    #[tokio::test]
    async fn full_batches_written_at_low_priority() {
        let sink = FlakySink::new(0);
        let (logger, writer) = ActivityLogger::new(sink.clone(), &config(2, 3));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(writer.run(cancel.clone()));

        for n in 0..4 {
            logger.log(entry(n));
        }
        while logger.stats().written.load(Ordering::SeqCst) < 4 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        task.await.unwrap();

        let batches = sink.batches.lock().unwrap().clone();
        assert_eq!(batches, vec![(2, Priority::Low), (2, Priority::Low)]);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let sink = FlakySink::new(2);
        let (logger, writer) = ActivityLogger::new(sink.clone(), &config(1, 3));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(writer.run(cancel.clone()));

        logger.log(entry(0));
        while logger.stats().written.load(Ordering::SeqCst) < 1 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(logger.stats().failed_attempts.load(Ordering::SeqCst), 2);
        assert_eq!(logger.stats().dropped.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn exhausted_retries_drop_and_count() {
        let sink = FlakySink::new(10);
        let (logger, writer) = ActivityLogger::new(sink.clone(), &config(1, 2));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(writer.run(cancel.clone()));

        logger.log(entry(0));
        while logger.stats().dropped.load(Ordering::SeqCst) < 1 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(logger.stats().failed_attempts.load(Ordering::SeqCst), 3);
        assert_eq!(logger.stats().written.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_drains_queue_at_high_priority() {
        let sink = FlakySink::new(0);
        let (logger, writer) = ActivityLogger::new(sink.clone(), &config(100, 3));
        for n in 0..5 {
            logger.log(entry(n));
        }
        let cancel = CancellationToken::new();
        cancel.cancel();
        writer.run(cancel).await;

        assert_eq!(*sink.batches.lock().unwrap(), vec![(5, Priority::High)]);
        assert_eq!(logger.stats().written.load(Ordering::SeqCst), 5);

        logger.log(entry(6));
        assert_eq!(logger.stats().dropped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sqlite_sink_persists_entries() {
        let pool = Arc::new(LeasePool::new(
            storage::connect_in_memory().await.unwrap(),
            &DatabaseConfig::default(),
        ));
        let sink = SqliteSink::new(pool.clone());
        let entries = vec![entry(1).user("alice").host("10.0.0.1"), entry(2)];
        assert_eq!(sink.write(&entries, Priority::Low).await.unwrap(), 2);

        let mut lease = pool.lease(Priority::Normal).await.unwrap();
        let rows = storage::activity::recent(&mut lease, 10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].user_concerned.as_deref(), Some("alice"));
        assert_eq!(rows[1].category, "lifecycle");
    }
}
