//! In-memory session table.
//!
//! One live session per user, keyed by username. Tokens and refresh digests
//! that have been rotated out are remembered (as SHA-256 fingerprints) for
//! one lifespan so any reuse can be recognised as a replay.

use super::AuthError;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};
use vault_types::SessionToken;

const TOKEN_BYTES: usize = 256;
const DIGEST_BYTES: usize = 64;

type Fingerprint = [u8; 32];

/// Live session state.
#[derive(Clone)]
pub struct SessionRecord {
    token: String,
    refresh_digest: String,
    lifespan: u64,
    valid_until: u64,
    iteration: u64,
    issued_at: u64,
}

impl std::fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRecord")
            .field("token", &"[REDACTED]")
            .field("valid_until", &self.valid_until)
            .field("iteration", &self.iteration)
            .finish()
    }
}

impl SessionRecord {
    fn to_token(&self) -> SessionToken {
        SessionToken {
            token: self.token.clone(),
            refresh_digest: self.refresh_digest.clone(),
            lifespan: self.lifespan,
            valid_until: self.valid_until,
            iteration: self.iteration,
        }
    }
}

/// A rotated-out credential.
#[derive(Debug, Clone)]
struct Superseded {
    username: String,
    forget_after: u64,
}

/// Session table plus replay memory.
pub struct SessionStore {
    sessions: DashMap<String, SessionRecord>,
    superseded_tokens: DashMap<Fingerprint, Superseded>,
    superseded_digests: DashMap<Fingerprint, Superseded>,
    lifespan: u64,
    refresh_not_before: u64,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("live", &self.sessions.len())
            .field("superseded_tokens", &self.superseded_tokens.len())
            .field("lifespan", &self.lifespan)
            .finish()
    }
}

/// Result of a session sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    /// Expired sessions removed.
    pub sessions: usize,
    /// Replay records forgotten.
    pub superseded: usize,
}

impl SessionStore {
    /// Create an empty store.
    pub fn new(lifespan: u64, refresh_not_before: u64) -> Self {
        Self {
            sessions: DashMap::new(),
            superseded_tokens: DashMap::new(),
            superseded_digests: DashMap::new(),
            lifespan,
            refresh_not_before,
        }
    }

    /// Start a fresh session at iteration 0, discarding any previous one.
    pub fn issue(&self, username: &str) -> Result<SessionToken, AuthError> {
        let now = current_timestamp();
        let record = SessionRecord {
            token: random_hex(TOKEN_BYTES)?,
            refresh_digest: random_hex(DIGEST_BYTES)?,
            lifespan: self.lifespan,
            valid_until: now.saturating_add(self.lifespan),
            iteration: 0,
            issued_at: now,
        };
        let token = record.to_token();
        self.sessions.insert(username.to_string(), record);
        Ok(token)
    }

    /// Check a presented token. Returns the live iteration.
    ///
    /// A superseded token terminates its owner's session.
    pub fn validate(&self, username: &str, token: &str) -> Result<u64, AuthError> {
        let now = current_timestamp();
        let live = self
            .sessions
            .get(username)
            .filter(|s| s.token == token)
            .map(|s| (s.valid_until, s.iteration));
        if let Some((valid_until, iteration)) = live {
            if now >= valid_until {
                self.sessions.remove(username);
                return Err(AuthError::TokenExpired);
            }
            return Ok(iteration);
        }

        let replayed = self
            .superseded_tokens
            .get(&fingerprint(token))
            .map(|s| s.username.clone());
        match replayed {
            Some(owner) => {
                self.sessions.remove(&owner);
                Err(AuthError::ReplayDetected { username: owner })
            }
            None => Err(AuthError::TokenUnknown),
        }
    }

    /// Rotate token and digest, bumping the iteration.
    pub fn refresh(&self, username: &str, token: &str, refresh_digest: &str) -> Result<SessionToken, AuthError> {
        let replayed = self
            .superseded_digests
            .get(&fingerprint(refresh_digest))
            .map(|s| s.username.clone());
        if let Some(owner) = replayed {
            self.sessions.remove(&owner);
            return Err(AuthError::RefreshReplay { username: owner });
        }

        self.validate(username, token)?;

        let now = current_timestamp();
        let mut session = self.sessions.get_mut(username).ok_or(AuthError::TokenUnknown)?;
        if session.refresh_digest != refresh_digest {
            return Err(AuthError::RefreshInvalid);
        }
        if now < session.issued_at.saturating_add(self.refresh_not_before) {
            return Err(AuthError::RefreshTooEarly);
        }

        let forget_after = now.saturating_add(self.lifespan);
        let superseded = Superseded {
            username: username.to_string(),
            forget_after,
        };
        self.superseded_tokens
            .insert(fingerprint(&session.token), superseded.clone());
        self.superseded_digests
            .insert(fingerprint(&session.refresh_digest), superseded);

        session.token = random_hex(TOKEN_BYTES)?;
        session.refresh_digest = random_hex(DIGEST_BYTES)?;
        session.valid_until = forget_after;
        session.issued_at = now;
        session.iteration += 1;
        Ok(session.to_token())
    }

    /// Drop a user's session. Its token is not remembered as superseded.
    pub fn terminate(&self, username: &str) -> bool {
        self.sessions.remove(username).is_some()
    }

    /// Current iteration of a live session.
    pub fn iteration(&self, username: &str) -> Option<u64> {
        self.sessions.get(username).map(|s| s.iteration)
    }

    /// Users with a session.
    pub fn live_users(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether there are no live sessions.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Remove expired sessions and stale replay records.
    pub fn sweep(&self) -> SweepStats {
        let now = current_timestamp();
        let before = self.sessions.len();
        self.sessions.retain(|_, s| now < s.valid_until);
        let sessions = before - self.sessions.len();

        let before = self.superseded_tokens.len() + self.superseded_digests.len();
        self.superseded_tokens.retain(|_, s| now < s.forget_after);
        self.superseded_digests.retain(|_, s| now < s.forget_after);
        let superseded = before - (self.superseded_tokens.len() + self.superseded_digests.len());

        SweepStats {
            sessions,
            superseded,
        }
    }
}

fn fingerprint(secret: &str) -> Fingerprint {
    Sha256::digest(secret.as_bytes()).into()
}

fn random_hex(len: usize) -> Result<String, AuthError> {
    let mut bytes = vec![0u8; len];
    getrandom::getrandom(&mut bytes).map_err(|e| AuthError::Hashing(e.to_string()))?;
    Ok(hex::encode(bytes))
}

/// Current Unix timestamp in seconds.
pub(crate) fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_has_wire_shape() {
        let store = SessionStore::new(3600, 0);
        let token = store.issue("alice").unwrap();
        token.validate().unwrap();
        assert_eq!(token.iteration, 0);
        assert_eq!(store.validate("alice", &token.token).unwrap(), 0);
    }

    #[test]
    fn refresh_rotates_and_old_token_is_replay() {
        let store = SessionStore::new(3600, 0);
        let first = store.issue("alice").unwrap();
        let second = store
            .refresh("alice", &first.token, &first.refresh_digest)
            .unwrap();
        assert_eq!(second.iteration, 1);
        assert_ne!(first.token, second.token);
        assert_ne!(first.refresh_digest, second.refresh_digest);

        let err = store.validate("alice", &first.token).unwrap_err();
        assert!(matches!(err, AuthError::ReplayDetected { ref username } if username == "alice"));
        // The replay killed the live session too.
        assert!(matches!(
            store.validate("alice", &second.token),
            Err(AuthError::TokenUnknown)
        ));
    }

    #[test]
    fn old_digest_is_refresh_replay() {
        let store = SessionStore::new(3600, 0);
        let first = store.issue("alice").unwrap();
        let second = store
            .refresh("alice", &first.token, &first.refresh_digest)
            .unwrap();
        let err = store
            .refresh("alice", &second.token, &first.refresh_digest)
            .unwrap_err();
        assert!(matches!(err, AuthError::RefreshReplay { .. }));
        assert!(store.iteration("alice").is_none());
    }

    #[test]
    fn wrong_digest_is_invalid() {
        let store = SessionStore::new(3600, 0);
        let token = store.issue("alice").unwrap();
        let err = store.refresh("alice", &token.token, &"0".repeat(128)).unwrap_err();
        assert!(matches!(err, AuthError::RefreshInvalid));
        assert_eq!(store.iteration("alice"), Some(0));
    }

    #[test]
    fn refresh_not_before_window() {
        let store = SessionStore::new(3600, 600);
        let token = store.issue("alice").unwrap();
        let err = store
            .refresh("alice", &token.token, &token.refresh_digest)
            .unwrap_err();
        assert!(matches!(err, AuthError::RefreshTooEarly));
    }

    #[test]
    fn expired_token_is_removed() {
        let store = SessionStore::new(0, 0);
        let token = store.issue("alice").unwrap();
        assert!(matches!(
            store.validate("alice", &token.token),
            Err(AuthError::TokenExpired)
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn token_is_bound_to_identity() {
        let store = SessionStore::new(3600, 0);
        let alice = store.issue("alice").unwrap();
        store.issue("bob").unwrap();
        assert!(matches!(
            store.validate("bob", &alice.token),
            Err(AuthError::TokenUnknown)
        ));
    }

    #[test]
    fn reauth_replaces_session_and_terminate_is_not_replay() {
        let store = SessionStore::new(3600, 0);
        let first = store.issue("alice").unwrap();
        let second = store.issue("alice").unwrap();
        assert!(matches!(
            store.validate("alice", &first.token),
            Err(AuthError::TokenUnknown)
        ));
        assert!(store.terminate("alice"));
        assert!(!store.terminate("alice"));
        assert!(matches!(
            store.validate("alice", &second.token),
            Err(AuthError::TokenUnknown)
        ));
    }

    #[test]
    fn sweep_removes_expired() {
        let store = SessionStore::new(0, 0);
        let token = store.issue("alice").unwrap();
        store.issue("bob").unwrap();
        // Lifespan 0: rotated credentials are forgotten immediately too.
        let _ = store.refresh("alice", &token.token, &token.refresh_digest);
        let stats = store.sweep();
        assert_eq!(store.len(), 0);
        assert!(stats.sessions >= 1);
    }
}
