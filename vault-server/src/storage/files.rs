//! File metadata rows.

use super::unix_now;
use crate::pool::{Lease, PoolResult};

/// A stored file.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FileRecord {
    /// Owning account.
    pub owner: String,
    /// File name, unique per owner.
    pub filename: String,
    /// Size in bytes.
    pub size: i64,
    /// Readable by any authenticated user.
    pub public: bool,
    /// Creation time (Unix seconds).
    pub created_at: i64,
}

/// Insert a file row. Returns `false` if the owner already has that name.
pub async fn insert(lease: &mut Lease, owner: &str, filename: &str, size: u64) -> PoolResult<bool> {
    let inserted = lease
        .execute(
            sqlx::query(
                "INSERT INTO files (owner, filename, size, public, created_at) VALUES (?1, ?2, ?3, 0, ?4)
                 ON CONFLICT(owner, filename) DO NOTHING",
            )
            .bind(owner)
            .bind(filename)
            .bind(size as i64)
            .bind(unix_now()),
        )
        .await?;
    Ok(inserted > 0)
}

/// Look up a file.
pub async fn get(lease: &mut Lease, owner: &str, filename: &str) -> PoolResult<Option<FileRecord>> {
    lease
        .fetch_optional(
            sqlx::query_as::<_, FileRecord>(
                "SELECT owner, filename, size, public, created_at FROM files
                 WHERE owner = ?1 AND filename = ?2",
            )
            .bind(owner)
            .bind(filename),
        )
        .await
}

/// All files of an owner.
pub async fn list_by_owner(lease: &mut Lease, owner: &str) -> PoolResult<Vec<FileRecord>> {
    lease
        .fetch_all(
            sqlx::query_as::<_, FileRecord>(
                "SELECT owner, filename, size, public, created_at FROM files
                 WHERE owner = ?1 ORDER BY filename",
            )
            .bind(owner),
        )
        .await
}

/// Record a new size.
pub async fn set_size(lease: &mut Lease, owner: &str, filename: &str, size: u64) -> PoolResult<bool> {
    let updated = lease
        .execute(
            sqlx::query("UPDATE files SET size = ?3 WHERE owner = ?1 AND filename = ?2")
                .bind(owner)
                .bind(filename)
                .bind(size as i64),
        )
        .await?;
    Ok(updated > 0)
}

/// Flip the public flag.
pub async fn set_public(lease: &mut Lease, owner: &str, filename: &str, public: bool) -> PoolResult<bool> {
    let updated = lease
        .execute(
            sqlx::query("UPDATE files SET public = ?3 WHERE owner = ?1 AND filename = ?2")
                .bind(owner)
                .bind(filename)
                .bind(public),
        )
        .await?;
    Ok(updated > 0)
}

/// Delete a file row. Grants on it cascade.
pub async fn delete(lease: &mut Lease, owner: &str, filename: &str) -> PoolResult<bool> {
    let deleted = lease
        .execute(
            sqlx::query("DELETE FROM files WHERE owner = ?1 AND filename = ?2")
                .bind(owner)
                .bind(filename),
        )
        .await?;
    Ok(deleted > 0)
}

/// Move a file to a new owner. Grants follow through `ON UPDATE CASCADE`,
/// so the caller must first drop any grant held by the new owner.
pub async fn transfer(lease: &mut Lease, owner: &str, filename: &str, new_owner: &str) -> PoolResult<bool> {
    let updated = lease
        .execute(
            sqlx::query("UPDATE files SET owner = ?3 WHERE owner = ?1 AND filename = ?2")
                .bind(owner)
                .bind(filename)
                .bind(new_owner),
        )
        .await?;
    Ok(updated > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::pool::{LeasePool, Priority};
    use crate::storage::{self, users};

    #[tokio::test]
    async fn file_lifecycle() {
        let pool = LeasePool::new(storage::connect_in_memory().await.unwrap(), &DatabaseConfig::default());
        let mut lease = pool.lease(Priority::Normal).await.unwrap();
        users::insert(&mut lease, "alice", "h").await.unwrap();
        users::insert(&mut lease, "bob", "h").await.unwrap();

        assert!(insert(&mut lease, "alice", "a.txt", 0).await.unwrap());
        assert!(!insert(&mut lease, "alice", "a.txt", 0).await.unwrap());
        assert!(set_size(&mut lease, "alice", "a.txt", 42).await.unwrap());
        assert!(set_public(&mut lease, "alice", "a.txt", true).await.unwrap());

        let file = get(&mut lease, "alice", "a.txt").await.unwrap().unwrap();
        assert_eq!(file.size, 42);
        assert!(file.public);

        assert!(transfer(&mut lease, "alice", "a.txt", "bob").await.unwrap());
        assert!(get(&mut lease, "alice", "a.txt").await.unwrap().is_none());
        assert_eq!(list_by_owner(&mut lease, "bob").await.unwrap().len(), 1);

        assert!(delete(&mut lease, "bob", "a.txt").await.unwrap());
        assert!(!delete(&mut lease, "bob", "a.txt").await.unwrap());
    }

    #[tokio::test]
    async fn deleting_owner_removes_files() {
        let pool = LeasePool::new(storage::connect_in_memory().await.unwrap(), &DatabaseConfig::default());
        let mut lease = pool.lease(Priority::Normal).await.unwrap();
        users::insert(&mut lease, "alice", "h").await.unwrap();
        insert(&mut lease, "alice", "a.txt", 3).await.unwrap();
        users::delete(&mut lease, "alice").await.unwrap();
        assert!(list_by_owner(&mut lease, "alice").await.unwrap().is_empty());
    }
}
