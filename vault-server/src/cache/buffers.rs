//! Open-file buffers.
//!
//! Reads and amends are keyed separately. Read buffers only remember a
//! reader's cursor between chunked READ requests and fall out on idle.
//!
//! Amend buffers serialize writers: each file has one slot behind an async
//! mutex. A request holds the mutex for its write; a chunked PATCHFROM or
//! REPLACEFROM additionally leaves a [`Claim`] on the slot so the file stays
//! reserved for that holder between requests.

use super::{CacheError, CacheResult, FileKey};
use crate::config::{BusyPolicy, CacheConfig};
use dashmap::DashMap;
use moka::sync::Cache;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};

const CLAIM_POLL: Duration = Duration::from_millis(25);

/// Chunked-read cursors.
#[derive(Clone)]
pub struct ReadBuffers {
    cursors: Cache<(FileKey, String), u64>,
}

impl ReadBuffers {
    /// Create from `[cache]`.
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            cursors: Cache::builder()
                .max_capacity(config.buffer_capacity)
                .time_to_idle(Duration::from_secs(config.buffer_idle_secs))
                .build(),
        }
    }

    /// Where `reader` left off in `key`, 0 if nowhere.
    pub fn cursor(&self, key: &FileKey, reader: &str) -> u64 {
        self.cursors
            .get(&(key.clone(), reader.to_string()))
            .unwrap_or(0)
    }

    /// Remember the next offset for `reader`.
    pub fn advance(&self, key: &FileKey, reader: &str, cursor: u64) {
        self.cursors.insert((key.clone(), reader.to_string()), cursor);
    }

    /// Forget `reader`'s cursor.
    pub fn finish(&self, key: &FileKey, reader: &str) {
        self.cursors.invalidate(&(key.clone(), reader.to_string()));
    }

    /// Forget every cursor on a file.
    pub fn invalidate_file(&self, key: &FileKey) {
        let stale: Vec<_> = self
            .cursors
            .iter()
            .filter(|(k, _)| k.0 == *key)
            .map(|(k, _)| (*k).clone())
            .collect();
        for k in stale {
            self.cursors.invalidate(&k);
        }
    }

    /// Run moka's pending expiry work.
    pub fn run_pending_tasks(&self) {
        self.cursors.run_pending_tasks();
    }

    /// Open read buffers (approximate).
    pub fn len(&self) -> u64 {
        self.cursors.entry_count()
    }

    /// Whether no read buffers are open (approximate).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Reservation of a file across requests by one holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    /// Username holding the claim.
    pub holder: String,
    /// Next write offset.
    pub cursor: u64,
    touched: Instant,
}

#[derive(Debug, Default)]
struct AmendSlot {
    claim: Option<Claim>,
}

/// Exclusive access to one file's amend slot. Dropping releases it.
pub struct AmendGuard {
    guard: OwnedMutexGuard<AmendSlot>,
    key: FileKey,
    idle: Duration,
}

impl std::fmt::Debug for AmendGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmendGuard")
            .field("key", &self.key)
            .field("claim", &self.guard.claim)
            .finish()
    }
}

impl AmendGuard {
    /// The file this guard covers.
    pub fn key(&self) -> &FileKey {
        &self.key
    }

    /// The live claim on the file, if any.
    pub fn claim(&self) -> Option<&Claim> {
        self.guard
            .claim
            .as_ref()
            .filter(|c| c.touched.elapsed() < self.idle)
    }

    /// Keep the file reserved for `holder` after this request.
    pub fn set_claim(&mut self, holder: &str, cursor: u64) {
        self.guard.claim = Some(Claim {
            holder: holder.to_string(),
            cursor,
            touched: Instant::now(),
        });
    }

    /// Release any claim.
    pub fn release_claim(&mut self) {
        self.guard.claim = None;
    }
}

/// Per-file writer serialization.
pub struct AmendBuffers {
    slots: DashMap<FileKey, Arc<Mutex<AmendSlot>>>,
    policy: BusyPolicy,
    contention_timeout: Duration,
    idle: Duration,
}

impl std::fmt::Debug for AmendBuffers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmendBuffers")
            .field("slots", &self.slots.len())
            .field("policy", &self.policy)
            .finish()
    }
}

impl AmendBuffers {
    /// Create from `[cache]`.
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            slots: DashMap::new(),
            policy: config.busy_policy,
            contention_timeout: config.contention_timeout(),
            idle: Duration::from_secs(config.buffer_idle_secs),
        }
    }

    /// Take the file's amend slot for `holder`.
    ///
    /// Under [`BusyPolicy::Wait`] a held slot or a foreign claim is waited
    /// out until the contention timeout; under [`BusyPolicy::FailFast`]
    /// either fails at once. Both end in [`CacheError::FileBusy`].
    pub async fn acquire(&self, key: &FileKey, holder: &str) -> CacheResult<AmendGuard> {
        let deadline = tokio::time::Instant::now() + self.contention_timeout;
        loop {
            let slot = self.slots.entry(key.clone()).or_default().clone();
            let guard = match self.policy {
                BusyPolicy::FailFast => slot
                    .clone()
                    .try_lock_owned()
                    .map_err(|_| CacheError::FileBusy)?,
                BusyPolicy::Wait => tokio::time::timeout_at(deadline, slot.clone().lock_owned())
                    .await
                    .map_err(|_| CacheError::FileBusy)?,
            };

            // The slot may have been dropped or replaced while we waited.
            let current = self
                .slots
                .get(key)
                .is_some_and(|s| Arc::ptr_eq(s.value(), &slot));
            if !current {
                continue;
            }

            let guard = AmendGuard {
                guard,
                key: key.clone(),
                idle: self.idle,
            };
            if guard.claim().map_or(true, |c| c.holder == holder) {
                return Ok(guard);
            }
            drop(guard);

            let now = tokio::time::Instant::now();
            if self.policy == BusyPolicy::FailFast || now >= deadline {
                return Err(CacheError::FileBusy);
            }
            tokio::time::sleep(CLAIM_POLL.min(deadline - now)).await;
        }
    }

    /// Drop a file's slot, e.g. after deletion. Waiters re-check and retry
    /// on a fresh slot.
    pub fn remove(&self, key: &FileKey) {
        self.slots.remove(key);
    }

    /// Drop slots nobody holds or claims.
    pub fn sweep_idle(&self) -> usize {
        let before = self.slots.len();
        let idle = self.idle;
        self.slots.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(state) => state
                    .claim
                    .as_ref()
                    .is_some_and(|c| c.touched.elapsed() < idle),
                Err(_) => true,
            }
        });
        before - self.slots.len()
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether there are no slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(policy: BusyPolicy, contention_timeout_ms: u64) -> CacheConfig {
        CacheConfig {
            busy_policy: policy,
            contention_timeout_ms,
            ..CacheConfig::default()
        }
    }

    #[tokio::test]
    async fn fail_fast_reports_busy() {
        let buffers = AmendBuffers::new(&config(BusyPolicy::FailFast, 1000));
        let key = FileKey::new("alice", "a.txt");
        let _held = buffers.acquire(&key, "alice").await.unwrap();
        assert!(matches!(
            buffers.acquire(&key, "bob").await,
            Err(CacheError::FileBusy)
        ));
    }

    #[tokio::test]
    async fn wait_policy_serializes_writers() {
        let buffers = Arc::new(AmendBuffers::new(&config(BusyPolicy::Wait, 2000)));
        let key = FileKey::new("alice", "a.txt");
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));

        let held = buffers.acquire(&key, "alice").await.unwrap();
        let waiter = {
            let (buffers, key, log) = (buffers.clone(), key.clone(), log.clone());
            tokio::spawn(async move {
                let _guard = buffers.acquire(&key, "bob").await.unwrap();
                log.lock().unwrap().push("bob");
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        log.lock().unwrap().push("alice");
        drop(held);
        waiter.await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn wait_policy_times_out() {
        let buffers = AmendBuffers::new(&config(BusyPolicy::Wait, 30));
        let key = FileKey::new("alice", "a.txt");
        let _held = buffers.acquire(&key, "alice").await.unwrap();
        assert!(matches!(
            buffers.acquire(&key, "bob").await,
            Err(CacheError::FileBusy)
        ));
    }

    #[tokio::test]
    async fn claims_persist_across_requests() {
        let buffers = AmendBuffers::new(&config(BusyPolicy::Wait, 50));
        let key = FileKey::new("alice", "a.txt");

        let mut guard = buffers.acquire(&key, "alice").await.unwrap();
        guard.set_claim("alice", 10);
        drop(guard);

        assert!(matches!(
            buffers.acquire(&key, "bob").await,
            Err(CacheError::FileBusy)
        ));
        let mut guard = buffers.acquire(&key, "alice").await.unwrap();
        assert_eq!(guard.claim().map(|c| c.cursor), Some(10));
        guard.release_claim();
        drop(guard);
        assert!(buffers.acquire(&key, "bob").await.is_ok());
    }

    #[tokio::test]
    async fn removed_slot_is_recreated() {
        let buffers = AmendBuffers::new(&config(BusyPolicy::FailFast, 0));
        let key = FileKey::new("alice", "a.txt");
        let mut guard = buffers.acquire(&key, "alice").await.unwrap();
        guard.set_claim("alice", 3);
        buffers.remove(&key);
        drop(guard);
        let guard = buffers.acquire(&key, "bob").await.unwrap();
        assert!(guard.claim().is_none());
    }

    #[tokio::test]
    async fn sweep_keeps_held_and_claimed_slots() {
        let buffers = AmendBuffers::new(&config(BusyPolicy::FailFast, 0));
        let held = FileKey::new("alice", "held");
        let claimed = FileKey::new("alice", "claimed");
        let idle = FileKey::new("alice", "idle");

        let _guard = buffers.acquire(&held, "alice").await.unwrap();
        let mut claim = buffers.acquire(&claimed, "alice").await.unwrap();
        claim.set_claim("alice", 0);
        drop(claim);
        drop(buffers.acquire(&idle, "alice").await.unwrap());

        assert_eq!(buffers.sweep_idle(), 1);
        assert_eq!(buffers.len(), 2);
    }

    #[test]
    fn read_cursors() {
        let reads = ReadBuffers::new(&CacheConfig::default());
        let key = FileKey::new("alice", "a.txt");
        assert_eq!(reads.cursor(&key, "bob"), 0);
        reads.advance(&key, "bob", 64);
        reads.advance(&key, "carol", 8);
        assert_eq!(reads.cursor(&key, "bob"), 64);
        reads.finish(&key, "bob");
        assert_eq!(reads.cursor(&key, "bob"), 0);
        reads.invalidate_file(&key);
        assert_eq!(reads.cursor(&key, "carol"), 0);
    }
}
