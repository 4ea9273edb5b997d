//! Persisted per-user storage aggregates.

use super::unix_now;
use crate::pool::{Lease, PoolResult};

/// Stored usage totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::FromRow)]
pub struct UsageRecord {
    /// Bytes across all owned files.
    pub bytes_used: i64,
    /// Number of owned files.
    pub file_count: i64,
}

/// Load the stored totals for a user.
pub async fn get(lease: &mut Lease, username: &str) -> PoolResult<Option<UsageRecord>> {
    lease
        .fetch_optional(
            sqlx::query_as::<_, UsageRecord>(
                "SELECT bytes_used, file_count FROM storage_usage WHERE username = ?1",
            )
            .bind(username),
        )
        .await
}

/// Totals recomputed from the file table.
pub async fn recompute(lease: &mut Lease, username: &str) -> PoolResult<UsageRecord> {
    let row = lease
        .fetch_optional(
            sqlx::query_as::<_, UsageRecord>(
                "SELECT COALESCE(SUM(size), 0) AS bytes_used, COUNT(*) AS file_count
                 FROM files WHERE owner = ?1",
            )
            .bind(username),
        )
        .await?;
    Ok(row.unwrap_or(UsageRecord {
        bytes_used: 0,
        file_count: 0,
    }))
}

/// Write totals. Rows for deleted users are not resurrected.
pub async fn store(lease: &mut Lease, username: &str, usage: UsageRecord) -> PoolResult<bool> {
    let written = lease
        .execute(
            sqlx::query(
                "INSERT INTO storage_usage (username, bytes_used, file_count, updated_at)
                 SELECT ?1, ?2, ?3, ?4 WHERE EXISTS (SELECT 1 FROM users WHERE username = ?1)
                 ON CONFLICT(username) DO UPDATE SET
                    bytes_used = excluded.bytes_used,
                    file_count = excluded.file_count,
                    updated_at = excluded.updated_at",
            )
            .bind(username)
            .bind(usage.bytes_used)
            .bind(usage.file_count)
            .bind(unix_now()),
        )
        .await?;
    Ok(written > 0)
}

/// Bring every user's stored totals in line with the file table. Returns
/// how many rows were corrected.
pub async fn reconcile(lease: &mut Lease) -> PoolResult<usize> {
    let usernames = lease
        .fetch_all(sqlx::query_as::<_, (String,)>("SELECT username FROM users"))
        .await?;
    let mut corrected = 0;
    for (username,) in usernames {
        let actual = recompute(lease, &username).await?;
        if get(lease, &username).await? != Some(actual) && store(lease, &username, actual).await? {
            tracing::debug!(
                "Usage of {} reconciled to {} bytes in {} files",
                username,
                actual.bytes_used,
                actual.file_count
            );
            corrected += 1;
        }
    }
    Ok(corrected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::pool::{LeasePool, Priority};
    use crate::storage::{self, files, users};

    #[tokio::test]
    async fn store_and_recompute() {
        let pool = LeasePool::new(storage::connect_in_memory().await.unwrap(), &DatabaseConfig::default());
        let mut lease = pool.lease(Priority::Low).await.unwrap();
        users::insert(&mut lease, "alice", "h").await.unwrap();
        files::insert(&mut lease, "alice", "a", 10).await.unwrap();
        files::insert(&mut lease, "alice", "b", 5).await.unwrap();

        let totals = recompute(&mut lease, "alice").await.unwrap();
        assert_eq!(totals, UsageRecord { bytes_used: 15, file_count: 2 });
        assert!(store(&mut lease, "alice", totals).await.unwrap());
        assert_eq!(get(&mut lease, "alice").await.unwrap(), Some(totals));
    }

    #[tokio::test]
    async fn store_skips_missing_user() {
        let pool = LeasePool::new(storage::connect_in_memory().await.unwrap(), &DatabaseConfig::default());
        let mut lease = pool.lease(Priority::Low).await.unwrap();
        let totals = UsageRecord { bytes_used: 1, file_count: 1 };
        assert!(!store(&mut lease, "ghost", totals).await.unwrap());
        assert!(get(&mut lease, "ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reconcile_repairs_stale_totals() {
        let pool = LeasePool::new(storage::connect_in_memory().await.unwrap(), &DatabaseConfig::default());
        let mut lease = pool.lease(Priority::Low).await.unwrap();
        users::insert(&mut lease, "alice", "h").await.unwrap();
        users::insert(&mut lease, "bob", "h").await.unwrap();
        users::insert(&mut lease, "carol", "h").await.unwrap();
        files::insert(&mut lease, "alice", "a", 10).await.unwrap();
        files::insert(&mut lease, "bob", "b", 3).await.unwrap();
        // alice's row predates a write; bob's is accurate; carol has none.
        store(&mut lease, "alice", UsageRecord { bytes_used: 4, file_count: 1 }).await.unwrap();
        store(&mut lease, "bob", UsageRecord { bytes_used: 3, file_count: 1 }).await.unwrap();

        assert_eq!(reconcile(&mut lease).await.unwrap(), 2);
        assert_eq!(
            get(&mut lease, "alice").await.unwrap(),
            Some(UsageRecord { bytes_used: 10, file_count: 1 })
        );
        assert_eq!(
            get(&mut lease, "carol").await.unwrap(),
            Some(UsageRecord { bytes_used: 0, file_count: 0 })
        );
        assert_eq!(reconcile(&mut lease).await.unwrap(), 0);
    }
}
