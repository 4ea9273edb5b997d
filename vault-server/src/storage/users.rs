//! User accounts.

use super::unix_now;
use crate::pool::{Lease, PoolResult};

/// A stored account.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRecord {
    /// Account name.
    pub username: String,
    /// Argon2id PHC string.
    pub password_hash: String,
    /// Creation time (Unix seconds).
    pub created_at: i64,
}

/// Insert an account. Returns `false` if the name is taken.
pub async fn insert(lease: &mut Lease, username: &str, password_hash: &str) -> PoolResult<bool> {
    let now = unix_now();
    let inserted = lease
        .execute(
            sqlx::query(
                "INSERT INTO users (username, password_hash, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(username) DO NOTHING",
            )
            .bind(username)
            .bind(password_hash)
            .bind(now),
        )
        .await?;
    if inserted == 0 {
        return Ok(false);
    }
    lease
        .execute(
            sqlx::query(
                "INSERT INTO storage_usage (username, bytes_used, file_count, updated_at)
                 VALUES (?1, 0, 0, ?2) ON CONFLICT(username) DO NOTHING",
            )
            .bind(username)
            .bind(now),
        )
        .await?;
    Ok(true)
}

/// Look up an account.
pub async fn get(lease: &mut Lease, username: &str) -> PoolResult<Option<UserRecord>> {
    lease
        .fetch_optional(
            sqlx::query_as::<_, UserRecord>(
                "SELECT username, password_hash, created_at FROM users WHERE username = ?1",
            )
            .bind(username),
        )
        .await
}

/// Whether an account exists.
pub async fn exists(lease: &mut Lease, username: &str) -> PoolResult<bool> {
    let found: Option<i64> = lease
        .fetch_scalar(sqlx::query_scalar("SELECT 1 FROM users WHERE username = ?1").bind(username))
        .await?;
    Ok(found.is_some())
}

/// Replace the stored hash.
pub async fn update_password(lease: &mut Lease, username: &str, password_hash: &str) -> PoolResult<bool> {
    let updated = lease
        .execute(
            sqlx::query("UPDATE users SET password_hash = ?2 WHERE username = ?1")
                .bind(username)
                .bind(password_hash),
        )
        .await?;
    Ok(updated > 0)
}

/// Delete an account. Files, grants held and usage cascade.
pub async fn delete(lease: &mut Lease, username: &str) -> PoolResult<bool> {
    let deleted = lease
        .execute(sqlx::query("DELETE FROM users WHERE username = ?1").bind(username))
        .await?;
    Ok(deleted > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::pool::{LeasePool, Priority};
    use crate::storage::{self, usage};

    #[tokio::test]
    async fn insert_get_delete() {
        let pool = LeasePool::new(storage::connect_in_memory().await.unwrap(), &DatabaseConfig::default());
        let mut lease = pool.lease(Priority::High).await.unwrap();

        assert!(insert(&mut lease, "alice", "hash").await.unwrap());
        assert!(!insert(&mut lease, "alice", "other").await.unwrap());
        assert!(exists(&mut lease, "alice").await.unwrap());

        let user = get(&mut lease, "alice").await.unwrap().unwrap();
        assert_eq!(user.password_hash, "hash");
        assert!(usage::get(&mut lease, "alice").await.unwrap().is_some());

        assert!(update_password(&mut lease, "alice", "new").await.unwrap());
        assert_eq!(get(&mut lease, "alice").await.unwrap().unwrap().password_hash, "new");

        assert!(delete(&mut lease, "alice").await.unwrap());
        assert!(!exists(&mut lease, "alice").await.unwrap());
        assert!(usage::get(&mut lease, "alice").await.unwrap().is_none());
        lease.commit().await.unwrap();
    }
}
