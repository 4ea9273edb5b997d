//! Ban ledger. A ban is active while its `lifted_at` is NULL.

use super::unix_now;
use crate::pool::{Lease, PoolResult};

/// A ban entry.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BanRecord {
    /// Row id.
    pub id: i64,
    /// Banned account.
    pub username: String,
    /// Short reason.
    pub reason: String,
    /// Optional longer description.
    pub description: Option<String>,
    /// Ban time (Unix seconds).
    pub banned_at: i64,
    /// Lift time, `None` while active.
    pub lifted_at: Option<i64>,
}

/// The user's active ban, if any.
pub async fn active(lease: &mut Lease, username: &str) -> PoolResult<Option<BanRecord>> {
    lease
        .fetch_optional(
            sqlx::query_as::<_, BanRecord>(
                "SELECT id, username, reason, description, banned_at, lifted_at
                 FROM ban_logs WHERE username = ?1 AND lifted_at IS NULL
                 ORDER BY banned_at DESC LIMIT 1",
            )
            .bind(username),
        )
        .await
}

/// Whether the user has an active ban.
pub async fn is_banned(lease: &mut Lease, username: &str) -> PoolResult<bool> {
    Ok(active(lease, username).await?.is_some())
}

/// Names of all currently banned users.
pub async fn banned_users(lease: &mut Lease) -> PoolResult<Vec<String>> {
    let rows = lease
        .fetch_all(sqlx::query_as::<_, (String,)>(
            "SELECT DISTINCT username FROM ban_logs WHERE lifted_at IS NULL",
        ))
        .await?;
    Ok(rows.into_iter().map(|(name,)| name).collect())
}

/// Record a ban. Returns `false` without writing if one is already active.
pub async fn insert(lease: &mut Lease, username: &str, reason: &str, description: Option<&str>) -> PoolResult<bool> {
    if is_banned(lease, username).await? {
        return Ok(false);
    }
    lease
        .execute(
            sqlx::query(
                "INSERT INTO ban_logs (username, reason, description, banned_at) VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(username)
            .bind(reason)
            .bind(description)
            .bind(unix_now()),
        )
        .await?;
    Ok(true)
}

/// Lift every active ban on the user. Returns `false` if none was active.
pub async fn lift(lease: &mut Lease, username: &str) -> PoolResult<bool> {
    let lifted = lease
        .execute(
            sqlx::query("UPDATE ban_logs SET lifted_at = ?2 WHERE username = ?1 AND lifted_at IS NULL")
                .bind(username)
                .bind(unix_now()),
        )
        .await?;
    Ok(lifted > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::pool::{LeasePool, Priority};
    use crate::storage;

    #[tokio::test]
    async fn ban_is_idempotent_and_liftable() {
        let pool = LeasePool::new(storage::connect_in_memory().await.unwrap(), &DatabaseConfig::default());
        let mut lease = pool.lease(Priority::High).await.unwrap();

        assert!(insert(&mut lease, "mallory", "abuse", Some("spam")).await.unwrap());
        assert!(!insert(&mut lease, "mallory", "abuse", None).await.unwrap());
        assert!(is_banned(&mut lease, "mallory").await.unwrap());
        assert_eq!(banned_users(&mut lease).await.unwrap(), vec!["mallory".to_string()]);

        let ban = active(&mut lease, "mallory").await.unwrap().unwrap();
        assert_eq!(ban.description.as_deref(), Some("spam"));

        assert!(lift(&mut lease, "mallory").await.unwrap());
        assert!(!lift(&mut lease, "mallory").await.unwrap());
        assert!(!is_banned(&mut lease, "mallory").await.unwrap());
    }
}
