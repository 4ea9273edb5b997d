//! Rate limiting.
//!
//! Four governor limiters guard the server: connection attempts keyed by
//! peer IP, requests keyed by the username already authenticated on the
//! connection, requests from connections with no authenticated user keyed
//! by peer IP, and one global request limiter that caps aggregate load
//! whatever the individual rates.
//!
//! A claimed identity is never a key. Until a password or token check has
//! bound a user to the connection, its requests are charged to the peer
//! address, so nobody can drain another user's bucket by naming them.

use crate::config::LimitsConfig;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

type KeyedLimiter<K> = RateLimiter<
    K,
    dashmap::DashMap<K, InMemoryState>,
    DefaultClock,
    NoOpMiddleware<governor::clock::QuantaInstant>,
>;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Server rate limiters.
#[derive(Clone)]
pub struct RateLimits {
    connection_limiter: Arc<KeyedLimiter<IpAddr>>,
    request_limiter: Arc<KeyedLimiter<String>>,
    anonymous_limiter: Arc<KeyedLimiter<IpAddr>>,
    global_limiter: Arc<DirectLimiter>,
}

impl std::fmt::Debug for RateLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimits")
            .field("connection_keys", &self.connection_limiter.len())
            .field("request_keys", &self.request_limiter.len())
            .field("anonymous_keys", &self.anonymous_limiter.len())
            .finish()
    }
}

fn nonzero(value: u32) -> NonZeroU32 {
    NonZeroU32::new(value).unwrap_or(NonZeroU32::MIN)
}

impl RateLimits {
    /// Create limiters from configuration. Zero rates are validated away
    /// at config load; here they clamp to one.
    pub fn new(config: &LimitsConfig) -> Self {
        Self {
            connection_limiter: Arc::new(RateLimiter::keyed(Quota::per_minute(nonzero(
                config.connections_per_ip,
            )))),
            request_limiter: Arc::new(RateLimiter::keyed(Quota::per_minute(nonzero(
                config.requests_per_minute,
            )))),
            anonymous_limiter: Arc::new(RateLimiter::keyed(Quota::per_minute(nonzero(
                config.requests_per_minute,
            )))),
            global_limiter: Arc::new(RateLimiter::direct(Quota::per_second(nonzero(
                config.global_requests_per_second,
            )))),
        }
    }

    /// Check a connection attempt from `ip`.
    pub fn check_connection(&self, ip: IpAddr) -> Result<(), RateLimitError> {
        self.connection_limiter
            .check_key(&ip)
            .map_err(|_| RateLimitError::ConnectionLimitExceeded)
    }

    /// Check a request against the global limit and then its own bucket.
    pub fn check_request(&self, key: RequestKey<'_>) -> Result<(), RateLimitError> {
        self.global_limiter
            .check()
            .map_err(|_| RateLimitError::GlobalLimitExceeded)?;
        match key {
            RequestKey::User(user) => self
                .request_limiter
                .check_key(&user.to_string())
                .map_err(|_| RateLimitError::RequestLimitExceeded),
            RequestKey::Anonymous(ip) => self
                .anonymous_limiter
                .check_key(&ip)
                .map_err(|_| RateLimitError::RequestLimitExceeded),
        }
    }

    /// Tracked keys across the keyed limiters.
    pub fn tracked_keys(&self) -> usize {
        self.connection_limiter.len() + self.request_limiter.len() + self.anonymous_limiter.len()
    }

    /// Evict keys whose cells have fully recharged.
    pub fn shrink(&self) {
        self.connection_limiter.retain_recent();
        self.request_limiter.retain_recent();
        self.anonymous_limiter.retain_recent();
    }
}

/// Whose bucket a request is charged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKey<'a> {
    /// A user authenticated earlier on this connection.
    User(&'a str),
    /// No authenticated user yet; charged to the peer address.
    Anonymous(IpAddr),
}

/// Rate limit error types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    /// Too many connection attempts from this address.
    ConnectionLimitExceeded,
    /// Too many requests from this user or, before authentication, this address.
    RequestLimitExceeded,
    /// Server-wide request rate exceeded.
    GlobalLimitExceeded,
}

impl std::fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionLimitExceeded => write!(f, "connection rate limit exceeded"),
            Self::RequestLimitExceeded => write!(f, "request rate limit exceeded"),
            Self::GlobalLimitExceeded => write!(f, "global rate limit exceeded"),
        }
    }
}

impl std::error::Error for RateLimitError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(connections: u32, requests: u32, global: u32) -> LimitsConfig {
        LimitsConfig {
            connections_per_ip: connections,
            requests_per_minute: requests,
            global_requests_per_second: global,
        }
    }

    #[test]
    fn connection_limit_per_ip() {
        let limits = RateLimits::new(&config(3, 100, 1000));
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        for _ in 0..3 {
            assert!(limits.check_connection(a).is_ok());
        }
        assert_eq!(
            limits.check_connection(a),
            Err(RateLimitError::ConnectionLimitExceeded)
        );
        assert!(limits.check_connection(b).is_ok());
    }

    #[test]
    fn request_limit_per_user() {
        let limits = RateLimits::new(&config(100, 2, 1000));
        assert!(limits.check_request(RequestKey::User("alice")).is_ok());
        assert!(limits.check_request(RequestKey::User("alice")).is_ok());
        assert_eq!(
            limits.check_request(RequestKey::User("alice")),
            Err(RateLimitError::RequestLimitExceeded)
        );
        assert!(limits.check_request(RequestKey::User("bob")).is_ok());
    }

    #[test]
    fn anonymous_requests_charge_the_peer_not_a_user() {
        let limits = RateLimits::new(&config(100, 2, 1000));
        let attacker: IpAddr = "10.0.0.66".parse().unwrap();
        for _ in 0..2 {
            assert!(limits.check_request(RequestKey::Anonymous(attacker)).is_ok());
        }
        assert_eq!(
            limits.check_request(RequestKey::Anonymous(attacker)),
            Err(RateLimitError::RequestLimitExceeded)
        );
        assert!(limits
            .check_request(RequestKey::Anonymous("10.0.0.1".parse().unwrap()))
            .is_ok());
        assert!(limits.check_request(RequestKey::User("alice")).is_ok());
    }

    #[test]
    fn global_limit_caps_everyone() {
        let limits = RateLimits::new(&config(100, 100, 3));
        for user in ["a", "b", "c"] {
            assert!(limits.check_request(RequestKey::User(user)).is_ok());
        }
        assert_eq!(
            limits.check_request(RequestKey::User("d")),
            Err(RateLimitError::GlobalLimitExceeded)
        );
    }

    #[test]
    fn zero_rate_clamps_to_one() {
        let limits = RateLimits::new(&config(0, 0, 0));
        assert!(limits.check_request(RequestKey::User("alice")).is_ok());
        assert!(limits.check_request(RequestKey::User("alice")).is_err());
    }

    #[test]
    fn shrink_keeps_working_limiters() {
        let limits = RateLimits::new(&config(5, 5, 1000));
        let _ = limits.check_connection("10.0.0.1".parse().unwrap());
        let _ = limits.check_request(RequestKey::User("alice"));
        let _ = limits.check_request(RequestKey::Anonymous("10.0.0.2".parse().unwrap()));
        assert_eq!(limits.tracked_keys(), 3);
        limits.shrink();
        assert!(limits.check_request(RequestKey::User("alice")).is_ok());
    }

    #[test]
    fn error_display() {
        assert_eq!(
            RateLimitError::RequestLimitExceeded.to_string(),
            "request rate limit exceeded"
        );
    }
}
