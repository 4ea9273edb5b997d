//! Deleted-file tombstones.

use super::FileKey;
use moka::sync::Cache;
use std::time::Duration;

/// Short-TTL record of recently deleted files.
///
/// Lets requests racing a deletion fail with not-found without a database
/// round trip. Entries expire on their own.
#[derive(Clone)]
pub struct Tombstones {
    cache: Cache<FileKey, ()>,
}

impl Tombstones {
    /// Create a tombstone cache.
    pub fn new(ttl: Duration, capacity: u64) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Record a deletion.
    pub fn mark(&self, key: FileKey) {
        self.cache.insert(key, ());
    }

    /// Whether the file was deleted within the TTL.
    pub fn is_deleted(&self, key: &FileKey) -> bool {
        self.cache.contains_key(key)
    }

    /// Forget a deletion, e.g. when the name is reused.
    pub fn clear(&self, key: &FileKey) {
        self.cache.invalidate(key);
    }

    /// Run moka's pending expiry work.
    pub fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks();
    }

    /// Live tombstones (approximate).
    pub fn len(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Whether no tombstones are held (approximate).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
