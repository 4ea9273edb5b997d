//! Session and authentication manager.
//!
//! Owns credential checks, the session table, bans and file authorization.
//! Account writes lease at [`Priority::High`]; authorization lookups run on
//! the caller's lease.

mod authorize;
mod password;
mod session;

pub use authorize::{permits, resolve, FileAccess};
pub use password::PasswordHashing;
pub use session::{SessionStore, SweepStats};

pub(crate) use session::current_timestamp;

use crate::activity::{ActivityEntry, ActivityLogger, LogAuthor, LogCategory};
use crate::config::AuthConfig;
use crate::pool::{LeasePool, PoolError, Priority};
use crate::storage::{bans, files, users};
use std::sync::Arc;
use vault_types::{Permission, SessionToken};

/// Authentication and authorization failures.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Wrong password.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// No such account.
    #[error("user not found")]
    UserNotFound,

    /// Account name taken.
    #[error("user already exists")]
    UserExists,

    /// Account is banned.
    #[error("user is banned")]
    Banned,

    /// Session lifespan elapsed.
    #[error("token expired")]
    TokenExpired,

    /// Token matches no session.
    #[error("unknown token")]
    TokenUnknown,

    /// A superseded token was presented; the session was terminated.
    #[error("replayed token for {username}")]
    ReplayDetected {
        /// Owner of the replayed token.
        username: String,
    },

    /// Refresh digest does not match the live session.
    #[error("invalid refresh digest")]
    RefreshInvalid,

    /// A superseded refresh digest was presented; the session was terminated.
    #[error("replayed refresh digest for {username}")]
    RefreshReplay {
        /// Owner of the replayed digest.
        username: String,
    },

    /// Refresh attempted inside the not-before window.
    #[error("refresh not yet allowed")]
    RefreshTooEarly,

    /// New password equals the current one.
    #[error("password unchanged")]
    PasswordUnchanged,

    /// Hashing or randomness failure.
    #[error("hashing failed: {0}")]
    Hashing(String),

    /// Lease or database failure.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Result type alias for auth operations.
pub type AuthResult<T> = std::result::Result<T, AuthError>;

/// An authenticated requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    /// Account name.
    pub username: String,
    /// Live session iteration.
    pub iteration: u64,
}

/// Credentials, sessions, bans and file authorization.
pub struct AuthManager {
    pool: Arc<LeasePool>,
    sessions: SessionStore,
    hashing: PasswordHashing,
    activity: ActivityLogger,
}

impl std::fmt::Debug for AuthManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthManager")
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}

impl AuthManager {
    /// Create a manager.
    pub fn new(pool: Arc<LeasePool>, config: &AuthConfig, activity: ActivityLogger) -> Self {
        Self {
            pool,
            sessions: SessionStore::new(config.session_lifespan_secs, config.refresh_not_before_secs),
            hashing: PasswordHashing::new(config),
            activity,
        }
    }

    /// The session table.
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Create an account.
    pub async fn register(&self, username: &str, password: &str) -> AuthResult<()> {
        let hash = self.hashing.hash(password).await?;
        let mut lease = self.pool.lease(Priority::High).await?;
        if !users::insert(&mut lease, username, &hash).await? {
            return Err(AuthError::UserExists);
        }
        lease.commit().await?;
        self.activity.log(
            ActivityEntry::new(1, LogAuthor::Auth, LogCategory::Account, "account created").user(username),
        );
        Ok(())
    }

    /// Check credentials and start a session at iteration 0.
    pub async fn authenticate(&self, username: &str, password: &str) -> AuthResult<SessionToken> {
        let mut lease = self.pool.lease(Priority::High).await?;
        let user = users::get(&mut lease, username)
            .await?
            .ok_or(AuthError::UserNotFound)?;
        let banned = bans::is_banned(&mut lease, username).await?;
        lease.rollback().await?;

        if banned {
            return Err(AuthError::Banned);
        }
        if !self.hashing.verify(password, &user.password_hash).await? {
            self.activity.log(
                ActivityEntry::new(2, LogAuthor::Auth, LogCategory::Session, "failed login").user(username),
            );
            return Err(AuthError::InvalidCredentials);
        }

        let token = self.sessions.issue(username)?;
        tracing::debug!("Session issued for {}", username);
        Ok(token)
    }

    /// Check a presented token, then the ban table. A ban recorded by any
    /// process sharing the database ends the session on its next request.
    pub async fn validate(&self, username: &str, token: &str) -> AuthResult<SessionContext> {
        let iteration = self.sessions.validate(username, token).inspect_err(|e| {
            if let AuthError::ReplayDetected { username: owner } = e {
                self.security_event(owner, "superseded token replayed, session terminated");
            }
        })?;

        let mut lease = self.pool.lease(Priority::Normal).await?;
        let banned = bans::is_banned(&mut lease, username).await?;
        lease.rollback().await?;
        if banned {
            self.sessions.terminate(username);
            self.security_event(username, "banned user presented a live token, session terminated");
            return Err(AuthError::Banned);
        }

        Ok(SessionContext {
            username: username.to_string(),
            iteration,
        })
    }

    /// Rotate the session's token and refresh digest.
    pub fn refresh(&self, username: &str, token: &str, refresh_digest: &str) -> AuthResult<SessionToken> {
        self.sessions
            .refresh(username, token, refresh_digest)
            .inspect_err(|e| match e {
                AuthError::ReplayDetected { username: owner } => {
                    self.security_event(owner, "superseded token replayed, session terminated")
                }
                AuthError::RefreshReplay { username: owner } => {
                    self.security_event(owner, "superseded refresh digest replayed, session terminated")
                }
                _ => {}
            })
    }

    /// End a session on the user's request.
    pub fn terminate(&self, username: &str) -> bool {
        self.sessions.terminate(username)
    }

    /// Replace the password. The session stays live.
    pub async fn change_password(&self, username: &str, current: &str, new: &str) -> AuthResult<()> {
        if current == new {
            return Err(AuthError::PasswordUnchanged);
        }
        self.verify_password(username, current).await?;
        let hash = self.hashing.hash(new).await?;
        let mut lease = self.pool.lease(Priority::High).await?;
        if !users::update_password(&mut lease, username, &hash).await? {
            return Err(AuthError::UserNotFound);
        }
        lease.commit().await?;
        self.activity.log(
            ActivityEntry::new(2, LogAuthor::Auth, LogCategory::Account, "password changed").user(username),
        );
        Ok(())
    }

    /// Delete an account after re-checking its password. Returns the names
    /// of the files it owned so the caller can clear them from disk and
    /// caches.
    pub async fn delete_user(&self, username: &str, password: &str) -> AuthResult<Vec<String>> {
        self.verify_password(username, password).await?;
        let mut lease = self.pool.lease(Priority::High).await?;
        let owned = files::list_by_owner(&mut lease, username)
            .await?
            .into_iter()
            .map(|f| f.filename)
            .collect();
        if !users::delete(&mut lease, username).await? {
            return Err(AuthError::UserNotFound);
        }
        lease.commit().await?;
        self.sessions.terminate(username);
        self.activity.log(
            ActivityEntry::new(3, LogAuthor::Auth, LogCategory::Account, "account deleted").user(username),
        );
        Ok(owned)
    }

    /// Ban a user and end their session. Returns `false` if already banned.
    pub async fn ban(&self, username: &str, reason: &str, description: Option<&str>) -> AuthResult<bool> {
        let mut lease = self.pool.lease(Priority::High).await?;
        if !users::exists(&mut lease, username).await? {
            return Err(AuthError::UserNotFound);
        }
        let banned = bans::insert(&mut lease, username, reason, description).await?;
        lease.commit().await?;
        self.sessions.terminate(username);
        if banned {
            tracing::info!("Banned {}: {}", username, reason);
            self.activity.log(
                ActivityEntry::new(4, LogAuthor::Admin, LogCategory::Account, format!("banned: {reason}"))
                    .user(username),
            );
        }
        Ok(banned)
    }

    /// Lift a ban. Returns `false` if none was active.
    pub async fn unban(&self, username: &str) -> AuthResult<bool> {
        let mut lease = self.pool.lease(Priority::High).await?;
        let lifted = bans::lift(&mut lease, username).await?;
        lease.commit().await?;
        if lifted {
            tracing::info!("Lifted ban on {}", username);
            self.activity.log(
                ActivityEntry::new(3, LogAuthor::Admin, LogCategory::Account, "ban lifted").user(username),
            );
        }
        Ok(lifted)
    }

    /// Terminate sessions of users banned since they logged in.
    pub async fn enforce_bans(&self) -> AuthResult<usize> {
        if self.sessions.is_empty() {
            return Ok(0);
        }
        let mut lease = self.pool.lease(Priority::Low).await?;
        let banned = bans::banned_users(&mut lease).await?;
        lease.rollback().await?;
        Ok(banned
            .iter()
            .filter(|user| self.sessions.terminate(user))
            .count())
    }

    /// Whether `requester` holds `permission` on `owner/filename`.
    /// Missing files authorize nothing.
    pub async fn authorize(
        &self,
        requester: &str,
        owner: &str,
        filename: &str,
        permission: Permission,
    ) -> AuthResult<bool> {
        let mut lease = self.pool.lease(Priority::Normal).await?;
        let access = resolve(&mut lease, requester, owner, filename).await?;
        lease.rollback().await?;
        Ok(access.is_some_and(|a| a.permits(permission)))
    }

    async fn verify_password(&self, username: &str, password: &str) -> AuthResult<()> {
        let mut lease = self.pool.lease(Priority::High).await?;
        let user = users::get(&mut lease, username)
            .await?
            .ok_or(AuthError::UserNotFound)?;
        lease.rollback().await?;
        if self.hashing.verify(password, &user.password_hash).await? {
            Ok(())
        } else {
            Err(AuthError::InvalidCredentials)
        }
    }

    fn security_event(&self, username: &str, details: &str) {
        tracing::warn!("Security event for {}: {}", username, details);
        self.activity
            .log(ActivityEntry::new(5, LogAuthor::Auth, LogCategory::Security, details).user(username));
    }
}
