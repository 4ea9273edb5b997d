//! Error types for strata-vault.

use std::path::PathBuf;

/// Main error type for server lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Lease pool error.
    #[error("pool error: {0}")]
    Pool(#[from] crate::pool::PoolError),

    /// Trust store error.
    #[error("trust error: {0}")]
    Trust(#[from] crate::trust::TrustError),

    /// File store error.
    #[error("file store error: {0}")]
    Files(#[from] crate::files::FileStoreError),

    /// Account operation error.
    #[error("auth error: {0}")]
    Auth(#[from] crate::auth::AuthError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage layer errors raised while opening and migrating the database.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// Database path error.
    #[error("invalid database path: {path}")]
    InvalidPath {
        /// The invalid path.
        path: PathBuf,
    },
}

/// Result type alias for server lifecycle operations.
pub type Result<T> = std::result::Result<T, VaultError>;

/// Result type alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
