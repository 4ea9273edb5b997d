//! SQLite schema and repositories.
//!
//! [`connect`] opens the database and runs migrations. The submodules are
//! thin repositories: each function takes a [`Lease`](crate::pool::Lease)
//! and runs inside its transaction, so callers decide the priority and the
//! commit point.

pub mod activity;
pub mod bans;
pub mod files;
pub mod grants;
pub mod usage;
pub mod users;

use crate::error::{StorageError, StorageResult};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Open (creating if missing) the database at `path` and migrate it.
pub async fn connect(path: &Path, max_connections: u32) -> StorageResult<SqlitePool> {
    let url = path.to_str().ok_or_else(|| StorageError::InvalidPath {
        path: path.to_path_buf(),
    })?;
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;
    Ok(pool)
}

/// Open a migrated in-memory database (for testing).
///
/// A single connection keeps every query on the same in-memory database.
pub async fn connect_in_memory() -> StorageResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(":memory:")?
        .foreign_keys(true)
        .synchronous(SqliteSynchronous::Normal);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;
    Ok(pool)
}

const MIGRATIONS: &[(&str, &str)] = &[
    (
        "users",
        r#"
        CREATE TABLE IF NOT EXISTS users (
            username TEXT PRIMARY KEY,
            password_hash TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    ),
    (
        "files",
        r#"
        CREATE TABLE IF NOT EXISTS files (
            owner TEXT NOT NULL REFERENCES users(username) ON DELETE CASCADE,
            filename TEXT NOT NULL,
            size INTEGER NOT NULL DEFAULT 0,
            public INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (owner, filename)
        )
        "#,
    ),
    (
        "file_permissions",
        r#"
        CREATE TABLE IF NOT EXISTS file_permissions (
            file_owner TEXT NOT NULL,
            filename TEXT NOT NULL,
            grantee TEXT NOT NULL REFERENCES users(username) ON DELETE CASCADE,
            role TEXT NOT NULL,
            granted_by TEXT NOT NULL,
            granted_at INTEGER NOT NULL,
            expires_at INTEGER,
            PRIMARY KEY (file_owner, filename, grantee),
            FOREIGN KEY (file_owner, filename) REFERENCES files(owner, filename)
                ON DELETE CASCADE ON UPDATE CASCADE,
            CHECK (grantee <> file_owner)
        )
        "#,
    ),
    (
        "storage_usage",
        r#"
        CREATE TABLE IF NOT EXISTS storage_usage (
            username TEXT PRIMARY KEY REFERENCES users(username) ON DELETE CASCADE,
            bytes_used INTEGER NOT NULL DEFAULT 0,
            file_count INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL
        )
        "#,
    ),
    (
        "ban_logs",
        r#"
        CREATE TABLE IF NOT EXISTS ban_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL,
            reason TEXT NOT NULL,
            description TEXT,
            banned_at INTEGER NOT NULL,
            lifted_at INTEGER
        )
        "#,
    ),
    (
        "activity_logs",
        r#"
        CREATE TABLE IF NOT EXISTS activity_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            occurred_at INTEGER NOT NULL,
            severity INTEGER NOT NULL CHECK (severity BETWEEN 1 AND 5),
            logged_by TEXT NOT NULL,
            category TEXT NOT NULL,
            details TEXT NOT NULL,
            user_concerned TEXT,
            host_concerned TEXT
        )
        "#,
    ),
    (
        "idx_permissions_grantee",
        "CREATE INDEX IF NOT EXISTS idx_permissions_grantee ON file_permissions(grantee)",
    ),
    (
        "idx_permissions_expiry",
        "CREATE INDEX IF NOT EXISTS idx_permissions_expiry ON file_permissions(expires_at)",
    ),
    (
        "idx_active_bans",
        "CREATE INDEX IF NOT EXISTS idx_active_bans ON ban_logs(username, lifted_at)",
    ),
];

async fn run_migrations(pool: &SqlitePool) -> StorageResult<()> {
    for (name, sql) in MIGRATIONS {
        sqlx::query(sql)
            .execute(pool)
            .await
            .map_err(|e| StorageError::Migration(format!("{name}: {e}")))?;
    }
    Ok(())
}

/// Current Unix timestamp in seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = connect_in_memory().await.unwrap();
        run_migrations(&pool).await.unwrap();
        let tables: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .fetch_all(&pool)
                .await
                .unwrap();
        for table in ["activity_logs", "ban_logs", "file_permissions", "files", "storage_usage", "users"] {
            assert!(tables.iter().any(|t| t == table), "missing {table}");
        }
    }

    #[tokio::test]
    async fn on_disk_database_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.db");
        let pool = connect(&path, 2).await.unwrap();
        pool.close().await;
        assert!(path.exists());
    }

    #[tokio::test]
    async fn grants_cascade_with_their_file() {
        let pool = connect_in_memory().await.unwrap();
        for user in ["alice", "bob"] {
            sqlx::query("INSERT INTO users VALUES (?1, 'h', 0)")
                .bind(user)
                .execute(&pool)
                .await
                .unwrap();
        }
        sqlx::query("INSERT INTO files VALUES ('alice', 'a.txt', 0, 0, 0)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO file_permissions VALUES ('alice', 'a.txt', 'bob', 'reader', 'alice', 0, NULL)",
        )
        .execute(&pool)
        .await
        .unwrap();

        sqlx::query("DELETE FROM files WHERE owner = 'alice'")
            .execute(&pool)
            .await
            .unwrap();
        let left: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM file_permissions")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(left, 0);
    }

    #[tokio::test]
    async fn self_grant_is_rejected_by_schema() {
        let pool = connect_in_memory().await.unwrap();
        sqlx::query("INSERT INTO users VALUES ('alice', 'h', 0)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO files VALUES ('alice', 'a.txt', 0, 0, 0)")
            .execute(&pool)
            .await
            .unwrap();
        let result = sqlx::query(
            "INSERT INTO file_permissions VALUES ('alice', 'a.txt', 'alice', 'reader', 'alice', 0, NULL)",
        )
        .execute(&pool)
        .await;
        assert!(result.is_err());
    }
}
