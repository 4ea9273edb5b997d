//! Per-user storage accounting.
//!
//! Entries are loaded cache-aside from the `files` table and mutated in
//! memory on every create, resize, delete and transfer. Mutated entries are
//! dirty until [`StorageCache::flush`] writes their aggregates to
//! `storage_usage`. LRU eviction only ever drops clean entries, so no delta
//! is lost to memory pressure.

use super::{CacheError, CacheResult};
use crate::config::StorageConfig;
use crate::pool::{LeasePool, Priority};
use crate::storage::{files, usage};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

/// Aggregate usage of one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Usage {
    /// Bytes across owned files.
    pub bytes_used: u64,
    /// Number of owned files.
    pub file_count: u64,
    /// Byte quota.
    pub max_bytes: u64,
    /// File count limit.
    pub max_files: u64,
}

/// An applied size change that can be undone if the write it covers fails.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "roll back the reservation if the write fails"]
pub struct Reservation {
    owner: String,
    filename: String,
    previous: Option<u64>,
}

#[derive(Debug, Clone, Default)]
struct UserUsage {
    files: HashMap<String, u64>,
    bytes_used: u64,
    dirty: bool,
}

impl UserUsage {
    fn set(&mut self, filename: &str, size: Option<u64>) {
        let old = match size {
            Some(size) => self.files.insert(filename.to_string(), size),
            None => self.files.remove(filename),
        };
        self.bytes_used = self.bytes_used - old.unwrap_or(0) + size.unwrap_or(0);
        self.dirty = true;
    }
}

#[derive(Debug)]
struct Slot {
    usage: UserUsage,
    stamp: u64,
}

#[derive(Debug, Default)]
struct Lru {
    entries: HashMap<String, Slot>,
    order: BTreeMap<u64, String>,
    tick: u64,
}

impl Lru {
    fn touch(&mut self, user: &str) -> Option<&mut UserUsage> {
        self.tick += 1;
        let tick = self.tick;
        let slot = self.entries.get_mut(user)?;
        self.order.remove(&slot.stamp);
        slot.stamp = tick;
        self.order.insert(tick, user.to_string());
        Some(&mut slot.usage)
    }

    fn insert_if_absent(&mut self, user: String, usage: UserUsage) {
        if self.entries.contains_key(&user) {
            return;
        }
        self.tick += 1;
        self.order.insert(self.tick, user.clone());
        self.entries.insert(user, Slot { usage, stamp: self.tick });
    }

    fn remove(&mut self, user: &str) -> Option<UserUsage> {
        let slot = self.entries.remove(user)?;
        self.order.remove(&slot.stamp);
        Some(slot.usage)
    }

    /// Drop least recently used clean entries until within capacity.
    fn evict(&mut self, capacity: usize) {
        let excess = self.entries.len().saturating_sub(capacity);
        if excess == 0 {
            return;
        }
        let victims: Vec<String> = self
            .order
            .values()
            .filter(|user| self.entries.get(*user).is_some_and(|s| !s.usage.dirty))
            .take(excess)
            .cloned()
            .collect();
        for user in victims {
            self.remove(&user);
        }
    }

    fn get_mut(&mut self, user: &str) -> Option<&mut UserUsage> {
        self.entries.get_mut(user).map(|s| &mut s.usage)
    }
}

/// Cache-aside storage accounting with quota enforcement.
pub struct StorageCache {
    pool: Arc<LeasePool>,
    inner: Mutex<Lru>,
    capacity: usize,
    max_bytes: u64,
    max_files: u64,
}

impl std::fmt::Debug for StorageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageCache")
            .field("entries", &self.lock().entries.len())
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl StorageCache {
    /// Create an empty cache.
    pub fn new(pool: Arc<LeasePool>, capacity: usize, limits: &StorageConfig) -> Self {
        Self {
            pool,
            inner: Mutex::new(Lru::default()),
            capacity: capacity.max(1),
            max_bytes: limits.user_max_bytes,
            max_files: limits.user_max_files,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lru> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn load(&self, user: &str) -> CacheResult<UserUsage> {
        let mut lease = self.pool.lease(Priority::Normal).await?;
        let owned = files::list_by_owner(&mut lease, user).await?;
        lease.rollback().await?;
        let files: HashMap<String, u64> = owned
            .into_iter()
            .map(|f| (f.filename, f.size.max(0) as u64))
            .collect();
        Ok(UserUsage {
            bytes_used: files.values().sum(),
            files,
            dirty: false,
        })
    }

    /// Run `f` with every user in `users` resident. Loading awaits, so
    /// residency is re-checked under the lock before `f` runs.
    async fn with_users<R>(&self, users: &[&str], f: impl FnOnce(&mut Lru) -> R) -> CacheResult<R> {
        loop {
            let missing: Vec<&str> = {
                let inner = self.lock();
                users
                    .iter()
                    .copied()
                    .filter(|u| !inner.entries.contains_key(*u))
                    .collect()
            };
            let mut loaded = Vec::with_capacity(missing.len());
            for user in missing {
                loaded.push((user.to_string(), self.load(user).await?));
            }

            let mut inner = self.lock();
            for (user, usage) in loaded {
                inner.insert_if_absent(user, usage);
            }
            if users.iter().all(|u| inner.entries.contains_key(*u)) {
                for user in users {
                    inner.touch(user);
                }
                let result = f(&mut inner);
                inner.evict(self.capacity);
                return Ok(result);
            }
        }
    }

    fn usage_of(&self, entry: &UserUsage) -> Usage {
        Usage {
            bytes_used: entry.bytes_used,
            file_count: entry.files.len() as u64,
            max_bytes: self.max_bytes,
            max_files: self.max_files,
        }
    }

    fn check(&self, entry: &UserUsage, filename: &str, new_size: u64) -> CacheResult<()> {
        let old = entry.files.get(filename).copied();
        if old.is_none() && entry.files.len() as u64 >= self.max_files {
            return Err(CacheError::FileLimitExceeded {
                limit: self.max_files,
            });
        }
        let projected = entry.bytes_used - old.unwrap_or(0) + new_size;
        if projected > self.max_bytes {
            return Err(CacheError::QuotaExceeded {
                needed: new_size.saturating_sub(old.unwrap_or(0)),
                available: self.max_bytes.saturating_sub(entry.bytes_used),
            });
        }
        Ok(())
    }

    /// Current usage of a user.
    pub async fn usage(&self, user: &str) -> CacheResult<Usage> {
        self.with_users(&[user], |lru| lru.get_mut(user).map(|e| self.usage_of(e)))
            .await
            .map(|u| u.unwrap_or(Usage {
                bytes_used: 0,
                file_count: 0,
                max_bytes: self.max_bytes,
                max_files: self.max_files,
            }))
    }

    /// Set a file's size (creating it if new) after checking quota and
    /// file-count limits. Nothing changes when a limit would be exceeded.
    pub async fn reserve(&self, owner: &str, filename: &str, new_size: u64) -> CacheResult<Reservation> {
        self.with_users(&[owner], |lru| {
            let entry = lru.get_mut(owner).ok_or(CacheError::FileBusy)?;
            self.check(entry, filename, new_size)?;
            let previous = entry.files.get(filename).copied();
            entry.set(filename, Some(new_size));
            Ok(Reservation {
                owner: owner.to_string(),
                filename: filename.to_string(),
                previous,
            })
        })
        .await?
    }

    /// Undo a reservation.
    pub fn rollback(&self, reservation: Reservation) {
        let mut inner = self.lock();
        if let Some(entry) = inner.get_mut(&reservation.owner) {
            entry.set(&reservation.filename, reservation.previous);
        }
    }

    /// Forget a deleted file.
    pub async fn remove_file(&self, owner: &str, filename: &str) -> CacheResult<()> {
        self.with_users(&[owner], |lru| {
            if let Some(entry) = lru.get_mut(owner) {
                if entry.files.contains_key(filename) {
                    entry.set(filename, None);
                }
            }
        })
        .await
    }

    /// Move a file between users, checking the recipient's limits.
    pub async fn transfer_file(&self, from: &str, to: &str, filename: &str) -> CacheResult<()> {
        self.with_users(&[from, to], |lru| {
            let size = lru
                .get_mut(from)
                .and_then(|e| e.files.get(filename).copied())
                .unwrap_or(0);
            let recipient = lru.get_mut(to).ok_or(CacheError::FileBusy)?;
            self.check(recipient, filename, size)?;
            recipient.set(filename, Some(size));
            if let Some(sender) = lru.get_mut(from) {
                sender.set(filename, None);
            }
            Ok(())
        })
        .await?
    }

    /// Drop a deleted user's entry without flushing it.
    pub fn remove_user(&self, user: &str) {
        self.lock().remove(user);
    }

    /// Number of resident entries.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether no entries are resident.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of dirty entries.
    pub fn dirty_count(&self) -> usize {
        self.lock().entries.values().filter(|s| s.usage.dirty).count()
    }

    /// Write dirty aggregates in one transaction. On failure the entries
    /// are marked dirty again for the next flush.
    pub async fn flush(&self, priority: Priority) -> CacheResult<usize> {
        let dirty: Vec<(String, usage::UsageRecord)> = {
            let mut inner = self.lock();
            inner
                .entries
                .iter_mut()
                .filter(|(_, slot)| slot.usage.dirty)
                .map(|(user, slot)| {
                    slot.usage.dirty = false;
                    (
                        user.clone(),
                        usage::UsageRecord {
                            bytes_used: slot.usage.bytes_used as i64,
                            file_count: slot.usage.files.len() as i64,
                        },
                    )
                })
                .collect()
        };
        if dirty.is_empty() {
            return Ok(0);
        }

        let written = async {
            let mut lease = self.pool.lease(priority).await?;
            for (user, record) in &dirty {
                usage::store(&mut lease, user, *record).await?;
            }
            lease.commit().await
        }
        .await;

        match written {
            Ok(()) => {
                tracing::debug!("Flushed {} storage entries", dirty.len());
                Ok(dirty.len())
            }
            Err(e) => {
                let mut inner = self.lock();
                for (user, _) in &dirty {
                    if let Some(entry) = inner.get_mut(user) {
                        entry.dirty = true;
                    }
                }
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::storage::{self, users};

    fn limits(max_bytes: u64, max_files: u64) -> StorageConfig {
        StorageConfig {
            user_max_bytes: max_bytes,
            user_max_files: max_files,
            ..StorageConfig::default()
        }
    }

    async fn setup(capacity: usize, max_bytes: u64, max_files: u64) -> (Arc<LeasePool>, StorageCache) {
        let pool = Arc::new(LeasePool::new(
            storage::connect_in_memory().await.unwrap(),
            &DatabaseConfig::default(),
        ));
        let mut lease = pool.lease(Priority::High).await.unwrap();
        for user in ["alice", "bob", "carol"] {
            users::insert(&mut lease, user, "h").await.unwrap();
        }
        lease.commit().await.unwrap();
        let cache = StorageCache::new(pool.clone(), capacity, &limits(max_bytes, max_files));
        (pool, cache)
    }

    #[tokio::test]
    async fn cold_load_from_files_table() {
        let (pool, cache) = setup(8, 1000, 10).await;
        let mut lease = pool.lease(Priority::Normal).await.unwrap();
        files::insert(&mut lease, "alice", "a", 40).await.unwrap();
        files::insert(&mut lease, "alice", "b", 2).await.unwrap();
        lease.commit().await.unwrap();

        let usage = cache.usage("alice").await.unwrap();
        assert_eq!(usage.bytes_used, 42);
        assert_eq!(usage.file_count, 2);
        assert_eq!(cache.dirty_count(), 0);
    }

    #[tokio::test]
    async fn quota_exceeded_leaves_aggregate_unchanged() {
        let (_pool, cache) = setup(8, 10, 10).await;
        let _ = cache.reserve("alice", "a", 6).await.unwrap();
        let err = cache.reserve("alice", "a", 11).await.unwrap_err();
        assert!(matches!(err, CacheError::QuotaExceeded { needed: 5, available: 4 }));
        assert_eq!(cache.usage("alice").await.unwrap().bytes_used, 6);

        let _ = cache.reserve("alice", "a", 10).await.unwrap();
        assert_eq!(cache.usage("alice").await.unwrap().bytes_used, 10);
    }

    #[tokio::test]
    async fn file_limit_counts_new_files_only() {
        let (_pool, cache) = setup(8, 1000, 1).await;
        let _ = cache.reserve("alice", "a", 1).await.unwrap();
        let _ = cache.reserve("alice", "a", 2).await.unwrap();
        assert!(matches!(
            cache.reserve("alice", "b", 1).await,
            Err(CacheError::FileLimitExceeded { limit: 1 })
        ));
    }

    #[tokio::test]
    async fn rollback_restores_previous_size() {
        let (_pool, cache) = setup(8, 1000, 10).await;
        let _ = cache.reserve("alice", "a", 5).await.unwrap();
        let grown = cache.reserve("alice", "a", 50).await.unwrap();
        cache.rollback(grown);
        assert_eq!(cache.usage("alice").await.unwrap().bytes_used, 5);

        let created = cache.reserve("alice", "b", 7).await.unwrap();
        cache.rollback(created);
        assert_eq!(cache.usage("alice").await.unwrap().file_count, 1);
    }

    #[tokio::test]
    async fn transfer_checks_recipient_quota() {
        let (_pool, cache) = setup(8, 10, 10).await;
        let _ = cache.reserve("alice", "big", 8).await.unwrap();
        let _ = cache.reserve("bob", "mine", 5).await.unwrap();
        assert!(matches!(
            cache.transfer_file("alice", "bob", "big").await,
            Err(CacheError::QuotaExceeded { .. })
        ));
        cache.transfer_file("alice", "carol", "big").await.unwrap();
        assert_eq!(cache.usage("alice").await.unwrap().bytes_used, 0);
        assert_eq!(cache.usage("carol").await.unwrap().bytes_used, 8);
    }

    #[tokio::test]
    async fn flush_persists_and_clears_dirty() {
        let (pool, cache) = setup(8, 1000, 10).await;
        let _ = cache.reserve("alice", "a", 12).await.unwrap();
        assert_eq!(cache.dirty_count(), 1);
        assert_eq!(cache.flush(Priority::Low).await.unwrap(), 1);
        assert_eq!(cache.dirty_count(), 0);

        let mut lease = pool.lease(Priority::Normal).await.unwrap();
        let stored = usage::get(&mut lease, "alice").await.unwrap().unwrap();
        assert_eq!(stored.bytes_used, 12);
        assert_eq!(stored.file_count, 1);
    }

    #[tokio::test]
    async fn eviction_skips_dirty_entries() {
        let (_pool, cache) = setup(1, 1000, 10).await;
        let _ = cache.reserve("alice", "a", 1).await.unwrap();
        cache.usage("bob").await.unwrap();
        // alice is dirty so bob, although newer, is the one dropped.
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.dirty_count(), 1);

        cache.flush(Priority::Low).await.unwrap();
        cache.usage("bob").await.unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.dirty_count(), 0);
    }
}
