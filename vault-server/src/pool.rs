//! Priority-tiered database leases.
//!
//! One SQLite pool sits behind three independent tiers. Each tier has its
//! own concurrency cap, so batch writers at [`Priority::Low`] can never hold
//! the slots interactive handlers need.
//!
//! A [`Lease`] wraps a single transaction. It exposes only query, commit and
//! rollback, and carries a stamped expiry that every call checks. Dropping a
//! lease rolls back any open transaction and frees its tier slot.

use crate::config::DatabaseConfig;
use sqlx::query::{Query, QueryAs, QueryScalar};
use sqlx::sqlite::{SqliteArguments, SqliteConnection, SqlitePool, SqliteRow};
use sqlx::{FromRow, Sqlite, Transaction};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Lease priority tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    /// Account operations and the final shutdown flush.
    High,
    /// Request handlers.
    Normal,
    /// Background batch writers.
    Low,
}

impl Priority {
    fn index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }

    /// Label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

/// Lease pool errors.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// No connection could be obtained from the tier or the pool is closed.
    #[error("connection pool exhausted ({0} tier)")]
    PoolExhausted(&'static str),

    /// Waiting for a tier slot took longer than the acquire timeout.
    #[error("timed out waiting for a {0} lease")]
    Timeout(&'static str),

    /// The lease outlived its expiry and may no longer be used.
    #[error("lease {stamp} expired")]
    LeaseExpired {
        /// Stamp of the expired lease.
        stamp: u64,
    },

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl PoolError {
    /// Whether retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            PoolError::PoolExhausted(_) | PoolError::Timeout(_) => true,
            PoolError::LeaseExpired { .. } => false,
            PoolError::Database(e) => is_transient_sqlx(e),
        }
    }
}

/// Result type alias for lease operations.
pub type PoolResult<T> = std::result::Result<T, PoolError>;

/// Busy or locked database, or a pool-level timeout.
fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => matches!(db.code().as_deref(), Some("5") | Some("6")),
        _ => false,
    }
}

/// Lease counters for monitoring.
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Leases handed out.
    pub granted: AtomicU64,
    /// Lease requests that timed out or found the pool exhausted.
    pub refused: AtomicU64,
    /// Operations rejected because their lease had expired.
    pub expired: AtomicU64,
}

/// Arbitrates access to the database through priority-tiered leases.
pub struct LeasePool {
    pool: SqlitePool,
    tiers: [Arc<Semaphore>; 3],
    caps: [usize; 3],
    lease_duration: Duration,
    acquire_timeout: Duration,
    begin_retries: u32,
    retry_backoff: Duration,
    next_stamp: AtomicU64,
    stats: Arc<PoolStats>,
}

impl std::fmt::Debug for LeasePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeasePool")
            .field("caps", &self.caps)
            .field("lease_duration", &self.lease_duration)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish_non_exhaustive()
    }
}

impl LeasePool {
    /// Wrap a connection pool with tiers sized from configuration.
    pub fn new(pool: SqlitePool, config: &DatabaseConfig) -> Self {
        let caps = [
            config.high_connections,
            config.normal_connections,
            config.low_connections,
        ];
        Self {
            pool,
            tiers: caps.map(|cap| Arc::new(Semaphore::new(cap))),
            caps,
            lease_duration: config.lease_duration(),
            acquire_timeout: config.acquire_timeout(),
            begin_retries: config.begin_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            next_stamp: AtomicU64::new(1),
            stats: Arc::new(PoolStats::default()),
        }
    }

    /// Lease a transaction at the given priority.
    ///
    /// Fails with [`PoolError::Timeout`] if the tier stays full for the
    /// acquire timeout, and with [`PoolError::PoolExhausted`] if the pool is
    /// closed or no connection frees up after the configured retries.
    pub async fn lease(&self, priority: Priority) -> PoolResult<Lease> {
        let tier = &self.tiers[priority.index()];
        let permit = match tokio::time::timeout(self.acquire_timeout, tier.clone().acquire_owned())
            .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => {
                self.stats.refused.fetch_add(1, Ordering::Relaxed);
                return Err(PoolError::PoolExhausted(priority.as_str()));
            }
            Err(_elapsed) => {
                self.stats.refused.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Lease timeout on {} tier", priority.as_str());
                return Err(PoolError::Timeout(priority.as_str()));
            }
        };

        let mut attempt = 0;
        let tx = loop {
            match self.pool.begin().await {
                Ok(tx) => break tx,
                Err(e) if is_transient_sqlx(&e) && attempt < self.begin_retries => {
                    let backoff = self.retry_backoff * 2u32.saturating_pow(attempt);
                    tracing::debug!(
                        "Transient error opening {} lease (attempt {}): {}",
                        priority.as_str(),
                        attempt + 1,
                        e
                    );
                    attempt += 1;
                    tokio::time::sleep(backoff).await;
                }
                Err(sqlx::Error::PoolTimedOut) | Err(sqlx::Error::PoolClosed) => {
                    self.stats.refused.fetch_add(1, Ordering::Relaxed);
                    return Err(PoolError::PoolExhausted(priority.as_str()));
                }
                Err(e) => return Err(PoolError::Database(e)),
            }
        };

        let stamp = self.next_stamp.fetch_add(1, Ordering::Relaxed);
        self.stats.granted.fetch_add(1, Ordering::Relaxed);
        Ok(Lease {
            tx: Some(tx),
            _permit: permit,
            priority,
            stamp,
            expires_at: Instant::now() + self.lease_duration,
            stats: self.stats.clone(),
        })
    }

    /// Free slots in a tier.
    pub fn available(&self, priority: Priority) -> usize {
        self.tiers[priority.index()].available_permits()
    }

    /// Configured cap of a tier.
    pub fn capacity(&self, priority: Priority) -> usize {
        self.caps[priority.index()]
    }

    /// Lease counters.
    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Refuse new leases and close the underlying pool once leases drain.
    pub async fn close(&self) {
        for tier in &self.tiers {
            tier.close();
        }
        self.pool.close().await;
    }
}

/// A time-boxed transaction handle.
pub struct Lease {
    tx: Option<Transaction<'static, Sqlite>>,
    _permit: OwnedSemaphorePermit,
    priority: Priority,
    stamp: u64,
    expires_at: Instant,
    stats: Arc<PoolStats>,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("priority", &self.priority)
            .field("stamp", &self.stamp)
            .field("open", &self.tx.is_some())
            .finish()
    }
}

impl Lease {
    /// Unique stamp of this lease.
    pub fn stamp(&self) -> u64 {
        self.stamp
    }

    /// Tier this lease was taken from.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Whether the lease has passed its expiry.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    fn connection(&mut self) -> PoolResult<&mut SqliteConnection> {
        if self.is_expired() {
            // Roll back now rather than at drop.
            self.tx = None;
            self.stats.expired.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Lease {} used after expiry", self.stamp);
            return Err(PoolError::LeaseExpired { stamp: self.stamp });
        }
        match self.tx.as_mut() {
            Some(tx) => Ok(&mut **tx),
            None => Err(PoolError::LeaseExpired { stamp: self.stamp }),
        }
    }

    /// Run a statement, returning rows affected.
    pub async fn execute<'q>(
        &mut self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> PoolResult<u64> {
        let conn = self.connection()?;
        Ok(query.execute(conn).await?.rows_affected())
    }

    /// Fetch at most one row.
    pub async fn fetch_optional<'q, O>(
        &mut self,
        query: QueryAs<'q, Sqlite, O, SqliteArguments<'q>>,
    ) -> PoolResult<Option<O>>
    where
        O: Send + Unpin + for<'r> FromRow<'r, SqliteRow>,
    {
        let conn = self.connection()?;
        Ok(query.fetch_optional(conn).await?)
    }

    /// Fetch every row.
    pub async fn fetch_all<'q, O>(
        &mut self,
        query: QueryAs<'q, Sqlite, O, SqliteArguments<'q>>,
    ) -> PoolResult<Vec<O>>
    where
        O: Send + Unpin + for<'r> FromRow<'r, SqliteRow>,
    {
        let conn = self.connection()?;
        Ok(query.fetch_all(conn).await?)
    }

    /// Fetch a single scalar, if a row exists.
    pub async fn fetch_scalar<'q, O>(
        &mut self,
        query: QueryScalar<'q, Sqlite, O, SqliteArguments<'q>>,
    ) -> PoolResult<Option<O>>
    where
        O: Send + Unpin,
        (O,): for<'r> FromRow<'r, SqliteRow>,
    {
        let conn = self.connection()?;
        Ok(query.fetch_optional(conn).await?)
    }

    /// Commit and release the lease.
    pub async fn commit(mut self) -> PoolResult<()> {
        self.connection()?;
        match self.tx.take() {
            Some(tx) => Ok(tx.commit().await?),
            None => Err(PoolError::LeaseExpired { stamp: self.stamp }),
        }
    }

    /// Roll back and release the lease.
    pub async fn rollback(mut self) -> PoolResult<()> {
        match self.tx.take() {
            Some(tx) => Ok(tx.rollback().await?),
            None => Ok(()),
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.tx.is_some() {
            tracing::trace!("Lease {} dropped without commit, rolling back", self.stamp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage;

    async fn test_pool(config: &DatabaseConfig) -> LeasePool {
        let pool = storage::connect_in_memory().await.unwrap();
        LeasePool::new(pool, config)
    }

    fn small_config() -> DatabaseConfig {
        DatabaseConfig {
            high_connections: 1,
            normal_connections: 1,
            low_connections: 1,
            acquire_timeout_ms: 50,
            ..DatabaseConfig::default()
        }
    }

    #[tokio::test]
    async fn lease_commit_persists() {
        let pool = test_pool(&small_config()).await;
        let mut lease = pool.lease(Priority::Normal).await.unwrap();
        lease
            .execute(
                sqlx::query("INSERT INTO users (username, password_hash, created_at) VALUES (?1, 'x', 0)")
                    .bind("alice"),
            )
            .await
            .unwrap();
        lease.commit().await.unwrap();

        let mut lease = pool.lease(Priority::Normal).await.unwrap();
        let count: Option<i64> = lease
            .fetch_scalar(sqlx::query_scalar("SELECT COUNT(*) FROM users"))
            .await
            .unwrap();
        assert_eq!(count, Some(1));
    }

    #[tokio::test]
    async fn dropped_lease_rolls_back() {
        let pool = test_pool(&small_config()).await;
        {
            let mut lease = pool.lease(Priority::High).await.unwrap();
            lease
                .execute(
                    sqlx::query("INSERT INTO users (username, password_hash, created_at) VALUES ('bob', 'x', 0)"),
                )
                .await
                .unwrap();
        }
        let mut lease = pool.lease(Priority::High).await.unwrap();
        let count: Option<i64> = lease
            .fetch_scalar(sqlx::query_scalar("SELECT COUNT(*) FROM users"))
            .await
            .unwrap();
        assert_eq!(count, Some(0));
    }

    #[tokio::test]
    async fn full_tier_times_out_without_starving_others() {
        let pool = test_pool(&small_config()).await;
        let held = pool.lease(Priority::Low).await.unwrap();
        assert_eq!(pool.available(Priority::Low), 0);

        let err = pool.lease(Priority::Low).await.unwrap_err();
        assert!(matches!(err, PoolError::Timeout("low")));
        assert_eq!(pool.stats().refused.load(Ordering::Relaxed), 1);

        // The high tier has its own slot; it only waits on the single
        // in-memory connection, which the low lease releases here.
        drop(held);
        let high = pool.lease(Priority::High).await.unwrap();
        assert_eq!(high.priority(), Priority::High);
    }

    #[tokio::test]
    async fn expired_lease_refuses_operations() {
        let config = DatabaseConfig {
            lease_duration_secs: 0,
            ..small_config()
        };
        let pool = test_pool(&config).await;
        let mut lease = pool.lease(Priority::Normal).await.unwrap();
        assert!(lease.is_expired());
        let err = lease
            .execute(sqlx::query("SELECT 1"))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::LeaseExpired { .. }));
        assert!(lease.commit().await.is_err());
        assert_eq!(pool.stats().expired.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn lease_released_after_expiry() {
        let config = DatabaseConfig {
            lease_duration_secs: 0,
            ..small_config()
        };
        let pool = test_pool(&config).await;
        let lease = pool.lease(Priority::Normal).await.unwrap();
        drop(lease);
        assert_eq!(pool.available(Priority::Normal), 1);
    }

    #[tokio::test]
    async fn stamps_are_unique() {
        let pool = test_pool(&small_config()).await;
        let a = pool.lease(Priority::High).await.unwrap().stamp();
        let b = pool.lease(Priority::High).await.unwrap().stamp();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn closed_pool_is_exhausted() {
        let pool = test_pool(&small_config()).await;
        pool.close().await;
        let err = pool.lease(Priority::High).await.unwrap_err();
        assert!(matches!(err, PoolError::PoolExhausted("high")));
    }

    #[test]
    fn transient_classification() {
        assert!(PoolError::Timeout("low").is_transient());
        assert!(!PoolError::LeaseExpired { stamp: 1 }.is_transient());
        assert!(PoolError::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!PoolError::Database(sqlx::Error::RowNotFound).is_transient());
    }
}
