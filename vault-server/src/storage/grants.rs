//! Per-file role grants.
//!
//! Expired rows are invisible to every lookup here; the cleanup sweeper
//! deletes them with [`purge_expired`].

use super::unix_now;
use crate::pool::{Lease, PoolResult};
use vault_types::Role;

/// A role granted on a file.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GrantRecord {
    /// Owner of the file.
    pub file_owner: String,
    /// File name.
    pub filename: String,
    /// User holding the role.
    pub grantee: String,
    /// Role name.
    pub role: String,
    /// User who made the grant.
    pub granted_by: String,
    /// Grant time (Unix seconds).
    pub granted_at: i64,
    /// Expiry (Unix seconds), `None` for permanent grants.
    pub expires_at: Option<i64>,
}

impl GrantRecord {
    /// Parsed role. Unknown role names grant nothing.
    pub fn role(&self) -> Option<Role> {
        Role::parse(&self.role)
    }
}

/// The grantee's live grant on a file.
pub async fn get_active(
    lease: &mut Lease,
    file_owner: &str,
    filename: &str,
    grantee: &str,
) -> PoolResult<Option<GrantRecord>> {
    lease
        .fetch_optional(
            sqlx::query_as::<_, GrantRecord>(
                "SELECT file_owner, filename, grantee, role, granted_by, granted_at, expires_at
                 FROM file_permissions
                 WHERE file_owner = ?1 AND filename = ?2 AND grantee = ?3
                   AND (expires_at IS NULL OR expires_at > ?4)",
            )
            .bind(file_owner)
            .bind(filename)
            .bind(grantee)
            .bind(unix_now()),
        )
        .await
}

/// Live grants on a file.
pub async fn list_for_file(lease: &mut Lease, file_owner: &str, filename: &str) -> PoolResult<Vec<GrantRecord>> {
    lease
        .fetch_all(
            sqlx::query_as::<_, GrantRecord>(
                "SELECT file_owner, filename, grantee, role, granted_by, granted_at, expires_at
                 FROM file_permissions
                 WHERE file_owner = ?1 AND filename = ?2
                   AND (expires_at IS NULL OR expires_at > ?3)
                 ORDER BY grantee",
            )
            .bind(file_owner)
            .bind(filename)
            .bind(unix_now()),
        )
        .await
}

/// Live grants held by a user.
pub async fn list_for_grantee(lease: &mut Lease, grantee: &str) -> PoolResult<Vec<GrantRecord>> {
    lease
        .fetch_all(
            sqlx::query_as::<_, GrantRecord>(
                "SELECT file_owner, filename, grantee, role, granted_by, granted_at, expires_at
                 FROM file_permissions
                 WHERE grantee = ?1 AND (expires_at IS NULL OR expires_at > ?2)
                 ORDER BY file_owner, filename",
            )
            .bind(grantee)
            .bind(unix_now()),
        )
        .await
}

/// Insert or replace the grantee's grant on a file.
pub async fn upsert(
    lease: &mut Lease,
    file_owner: &str,
    filename: &str,
    grantee: &str,
    role: Role,
    granted_by: &str,
    expires_at: Option<i64>,
) -> PoolResult<()> {
    lease
        .execute(
            sqlx::query(
                "INSERT INTO file_permissions
                    (file_owner, filename, grantee, role, granted_by, granted_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(file_owner, filename, grantee) DO UPDATE SET
                    role = excluded.role,
                    granted_by = excluded.granted_by,
                    granted_at = excluded.granted_at,
                    expires_at = excluded.expires_at",
            )
            .bind(file_owner)
            .bind(filename)
            .bind(grantee)
            .bind(role.as_str())
            .bind(granted_by)
            .bind(unix_now())
            .bind(expires_at),
        )
        .await?;
    Ok(())
}

/// Remove the grantee's grant, live or expired.
pub async fn delete(lease: &mut Lease, file_owner: &str, filename: &str, grantee: &str) -> PoolResult<bool> {
    let deleted = lease
        .execute(
            sqlx::query(
                "DELETE FROM file_permissions WHERE file_owner = ?1 AND filename = ?2 AND grantee = ?3",
            )
            .bind(file_owner)
            .bind(filename)
            .bind(grantee),
        )
        .await?;
    Ok(deleted > 0)
}

/// Remove every grant on a file.
pub async fn delete_for_file(lease: &mut Lease, file_owner: &str, filename: &str) -> PoolResult<u64> {
    lease
        .execute(
            sqlx::query("DELETE FROM file_permissions WHERE file_owner = ?1 AND filename = ?2")
                .bind(file_owner)
                .bind(filename),
        )
        .await
}

/// Delete grants whose expiry has passed.
pub async fn purge_expired(lease: &mut Lease) -> PoolResult<u64> {
    lease
        .execute(
            sqlx::query("DELETE FROM file_permissions WHERE expires_at IS NOT NULL AND expires_at <= ?1")
                .bind(unix_now()),
        )
        .await
}
