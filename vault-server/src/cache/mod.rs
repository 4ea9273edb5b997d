//! Process-wide caches.
//!
//! - [`StorageCache`]: per-user usage aggregates with quota checks, flushed
//!   to `storage_usage` in the background.
//! - [`ReadBuffers`] / [`AmendBuffers`]: open-file state for chunked reads
//!   and serialized amends.
//! - [`Tombstones`]: short-lived negative cache of deleted files.

mod buffers;
mod storage;
mod tombstones;

pub use buffers::{AmendBuffers, AmendGuard, Claim, ReadBuffers};
pub use storage::{Reservation, StorageCache, Usage};
pub use tombstones::Tombstones;

use crate::pool::PoolError;

/// Identifies a file by owner and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileKey {
    /// Owning user.
    pub owner: String,
    /// File name.
    pub filename: String,
}

impl FileKey {
    /// Build a key.
    pub fn new(owner: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            filename: filename.into(),
        }
    }
}

impl std::fmt::Display for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.filename)
    }
}

/// Cache layer errors.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Write would push the user over their byte quota.
    #[error("quota exceeded: {needed} bytes needed, {available} available")]
    QuotaExceeded {
        /// Bytes the operation needs.
        needed: u64,
        /// Bytes left under the quota.
        available: u64,
    },

    /// User already owns the maximum number of files.
    #[error("file limit of {limit} reached")]
    FileLimitExceeded {
        /// Configured limit.
        limit: u64,
    },

    /// Another holder is amending the file.
    #[error("file is busy")]
    FileBusy,

    /// Loading or flushing failed.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Result type alias for cache operations.
pub type CacheResult<T> = std::result::Result<T, CacheError>;
