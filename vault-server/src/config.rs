//! Configuration loading for strata-vault.
//!
//! Configuration is loaded from a TOML file (default: `vault.toml`).
//! Every section and field is optional and falls back to the defaults below.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for strata-vault.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Protocol listener configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// TLS and trust-on-first-use configuration.
    #[serde(default)]
    pub tls: TlsConfig,
    /// Database and lease pool configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Session and credential configuration.
    #[serde(default)]
    pub auth: AuthConfig,
    /// Per-user storage limits.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Cache layer configuration.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Activity log pipeline configuration.
    #[serde(default)]
    pub activity: ActivityConfig,
    /// Rate limiting configuration.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// HTTP endpoints configuration.
    #[serde(default)]
    pub http: HttpConfig,
    /// Sweep task configuration.
    #[serde(default)]
    pub cleanup: CleanupConfig,
    /// Shutdown configuration.
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Protocol listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the protocol listener (default: 0.0.0.0:6090).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Root directory holding one subdirectory per user.
    #[serde(default = "default_files_directory")]
    pub files_directory: PathBuf,
    /// Close a connection after this many idle seconds (default: 300).
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Largest request body accepted, in bytes (default: 4MB).
    #[serde(default = "default_max_body_size")]
    pub max_body_size: u32,
    /// Maximum concurrent connections (default: 1024).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// What to do with a peer whose certificate matches no pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustPolicy {
    /// Refuse the connection unless the peer proves a rotation.
    #[default]
    Strict,
    /// Accept and re-pin. Only for fully trusted networks.
    Override,
}

/// TLS and trust-on-first-use configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    /// Serve TLS (default: false, plain TCP).
    #[serde(default)]
    pub enabled: bool,
    /// PEM certificate chain.
    pub cert_path: Option<PathBuf>,
    /// PEM private key.
    pub key_path: Option<PathBuf>,
    /// JSON file holding pinned peer fingerprints.
    #[serde(default = "default_pin_store")]
    pub pin_store: PathBuf,
    /// Mismatch policy (default: strict).
    #[serde(default)]
    pub policy: TrustPolicy,
    /// Refuse peers that present no certificate (default: true).
    #[serde(default = "default_true")]
    pub require_peer_certificate: bool,
    /// Name put in rotated server certificates (default: localhost).
    #[serde(default = "default_server_name")]
    pub server_name: String,
    /// JSON file of signed rollover records (default: rollover.json).
    #[serde(default = "default_rollover_store")]
    pub rollover_store: PathBuf,
    /// Rollover records kept, newest first (default: 3).
    #[serde(default = "default_rollover_history")]
    pub rollover_history: usize,
    /// Seconds a rollover record stays valid (default: 86400).
    #[serde(default = "default_rollover_grace_secs")]
    pub rollover_grace_secs: u64,
    /// Random nonce bytes mixed into each rollover signature (default: 16).
    #[serde(default = "default_rollover_nonce_bytes")]
    pub rollover_nonce_bytes: usize,
    /// Seconds between checks for a replaced certificate file; 0 disables
    /// reloading (default: 60).
    #[serde(default = "default_certificate_reload_secs")]
    pub certificate_reload_secs: u64,
}

/// Database and lease pool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
    /// Concurrent leases for interactive account operations (default: 4).
    #[serde(default = "default_high_connections")]
    pub high_connections: usize,
    /// Concurrent leases for request handlers (default: 8).
    #[serde(default = "default_normal_connections")]
    pub normal_connections: usize,
    /// Concurrent leases for batch writers (default: 2).
    #[serde(default = "default_low_connections")]
    pub low_connections: usize,
    /// Lifetime of a lease in seconds (default: 30).
    #[serde(default = "default_lease_duration_secs")]
    pub lease_duration_secs: u64,
    /// How long to wait for a lease slot in milliseconds (default: 5000).
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// Retries when opening a transaction fails transiently (default: 3).
    #[serde(default = "default_begin_retries")]
    pub begin_retries: u32,
    /// Base backoff between retries in milliseconds (default: 50).
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

/// Session and credential configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Session lifespan in seconds (default: 86400).
    #[serde(default = "default_session_lifespan_secs")]
    pub session_lifespan_secs: u64,
    /// Minimum session age before `SREF` is accepted (default: 0).
    #[serde(default)]
    pub refresh_not_before_secs: u64,
    /// Argon2 memory cost in KiB (default: 19456).
    #[serde(default = "default_argon2_memory_kib")]
    pub argon2_memory_kib: u32,
    /// Argon2 iterations (default: 2).
    #[serde(default = "default_argon2_iterations")]
    pub argon2_iterations: u32,
    /// Argon2 lanes (default: 1).
    #[serde(default = "default_argon2_parallelism")]
    pub argon2_parallelism: u32,
}

/// Per-user storage limits.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Bytes a user may store across all owned files (default: 256MB).
    #[serde(default = "default_user_max_bytes")]
    pub user_max_bytes: u64,
    /// Files a user may own (default: 1000).
    #[serde(default = "default_user_max_files")]
    pub user_max_files: u64,
    /// Largest chunk a single READ returns (default: 1MB).
    #[serde(default = "default_max_read_chunk")]
    pub max_read_chunk: u32,
}

/// What a second amender does when a file is already being amended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusyPolicy {
    /// Wait up to `contention_timeout_ms`, then report busy.
    #[default]
    Wait,
    /// Report busy immediately.
    FailFast,
}

/// Cache layer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Users held in the storage cache before LRU eviction (default: 1024).
    #[serde(default = "default_storage_entries")]
    pub storage_entries: usize,
    /// Open file buffers per variant (default: 256).
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: u64,
    /// Idle seconds before a buffer is dropped (default: 120).
    #[serde(default = "default_buffer_idle_secs")]
    pub buffer_idle_secs: u64,
    /// Seconds a deletion tombstone lives (default: 30).
    #[serde(default = "default_tombstone_ttl_secs")]
    pub tombstone_ttl_secs: u64,
    /// Amend contention policy (default: wait).
    #[serde(default)]
    pub busy_policy: BusyPolicy,
    /// Wait bound under the `wait` policy in milliseconds (default: 2000).
    #[serde(default = "default_contention_timeout_ms")]
    pub contention_timeout_ms: u64,
    /// Dirty entry flush interval in seconds (default: 30).
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
}

/// Activity log pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ActivityConfig {
    /// Entries per bulk insert (default: 100).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Flush a partial batch after this many seconds (default: 5).
    #[serde(default = "default_activity_flush_secs")]
    pub flush_interval_secs: u64,
    /// Attempts per batch before dropping it (default: 5).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base exponential backoff in milliseconds (default: 100).
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Connections per remote IP per minute (default: 60).
    #[serde(default = "default_connections_per_ip")]
    pub connections_per_ip: u32,
    /// Requests per user per minute (default: 600).
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    /// Requests per second across all clients (default: 1000).
    #[serde(default = "default_global_requests_per_second")]
    pub global_requests_per_second: u32,
}

/// HTTP endpoints configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Serve the HTTP endpoints (default: true).
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Bind address for HTTP server (default: 127.0.0.1:6091).
    #[serde(default = "default_http_bind")]
    pub bind_address: String,
    /// Enable metrics endpoint (default: true).
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

/// Sweep task configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    /// Sweep interval in seconds (default: 60).
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,
    /// Enable sweep task (default: true).
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Shutdown configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    /// Seconds to wait for connections and flushes to finish (default: 15).
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset (default: "info").
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_bind_address() -> String {
    "0.0.0.0:6090".to_string()
}

fn default_files_directory() -> PathBuf {
    PathBuf::from("vault-files")
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_max_body_size() -> u32 {
    4 * 1024 * 1024 // 4MB
}

fn default_max_connections() -> usize {
    1024
}

fn default_pin_store() -> PathBuf {
    PathBuf::from("trust-pins.json")
}

fn default_server_name() -> String {
    "localhost".into()
}

fn default_rollover_store() -> PathBuf {
    PathBuf::from("rollover.json")
}

fn default_rollover_history() -> usize {
    3
}

fn default_rollover_grace_secs() -> u64 {
    86_400
}

fn default_rollover_nonce_bytes() -> usize {
    16
}

fn default_certificate_reload_secs() -> u64 {
    60
}

fn default_database_path() -> PathBuf {
    PathBuf::from("vault.db")
}

fn default_high_connections() -> usize {
    4
}

fn default_normal_connections() -> usize {
    8
}

fn default_low_connections() -> usize {
    2
}

fn default_lease_duration_secs() -> u64 {
    30
}

fn default_acquire_timeout_ms() -> u64 {
    5000
}

fn default_begin_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    50
}

fn default_session_lifespan_secs() -> u64 {
    24 * 60 * 60 // 1 day
}

fn default_argon2_memory_kib() -> u32 {
    19 * 1024
}

fn default_argon2_iterations() -> u32 {
    2
}

fn default_argon2_parallelism() -> u32 {
    1
}

fn default_user_max_bytes() -> u64 {
    256 * 1024 * 1024 // 256MB
}

fn default_user_max_files() -> u64 {
    1000
}

fn default_max_read_chunk() -> u32 {
    1024 * 1024 // 1MB
}

fn default_storage_entries() -> usize {
    1024
}

fn default_buffer_capacity() -> u64 {
    256
}

fn default_buffer_idle_secs() -> u64 {
    120
}

fn default_tombstone_ttl_secs() -> u64 {
    30
}

fn default_contention_timeout_ms() -> u64 {
    2000
}

fn default_flush_interval_secs() -> u64 {
    30
}

fn default_batch_size() -> usize {
    100
}

fn default_activity_flush_secs() -> u64 {
    5
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_base_ms() -> u64 {
    100
}

fn default_connections_per_ip() -> u32 {
    60
}

fn default_requests_per_minute() -> u32 {
    600
}

fn default_global_requests_per_second() -> u32 {
    1000
}

fn default_http_bind() -> String {
    "127.0.0.1:6091".to_string()
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_drain_timeout_secs() -> u64 {
    15
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            files_directory: default_files_directory(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_body_size: default_max_body_size(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_path: None,
            key_path: None,
            pin_store: default_pin_store(),
            policy: TrustPolicy::default(),
            require_peer_certificate: true,
            server_name: default_server_name(),
            rollover_store: default_rollover_store(),
            rollover_history: default_rollover_history(),
            rollover_grace_secs: default_rollover_grace_secs(),
            rollover_nonce_bytes: default_rollover_nonce_bytes(),
            certificate_reload_secs: default_certificate_reload_secs(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            high_connections: default_high_connections(),
            normal_connections: default_normal_connections(),
            low_connections: default_low_connections(),
            lease_duration_secs: default_lease_duration_secs(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            begin_retries: default_begin_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_lifespan_secs: default_session_lifespan_secs(),
            refresh_not_before_secs: 0,
            argon2_memory_kib: default_argon2_memory_kib(),
            argon2_iterations: default_argon2_iterations(),
            argon2_parallelism: default_argon2_parallelism(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            user_max_bytes: default_user_max_bytes(),
            user_max_files: default_user_max_files(),
            max_read_chunk: default_max_read_chunk(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            storage_entries: default_storage_entries(),
            buffer_capacity: default_buffer_capacity(),
            buffer_idle_secs: default_buffer_idle_secs(),
            tombstone_ttl_secs: default_tombstone_ttl_secs(),
            busy_policy: BusyPolicy::default(),
            contention_timeout_ms: default_contention_timeout_ms(),
            flush_interval_secs: default_flush_interval_secs(),
        }
    }
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval_secs: default_activity_flush_secs(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            connections_per_ip: default_connections_per_ip(),
            requests_per_minute: default_requests_per_minute(),
            global_requests_per_second: default_global_requests_per_second(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_http_bind(),
            metrics_enabled: true,
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_interval(),
            enabled: true,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ServerConfig {
    /// Idle window as a duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Port part of the bind address, or 0 if it has none.
    pub fn port(&self) -> u16 {
        self.bind_address
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
            .unwrap_or(0)
    }
}

impl DatabaseConfig {
    /// Lease lifetime as a duration.
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    /// Lease acquisition bound as a duration.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Total connections across all tiers.
    pub fn total_connections(&self) -> usize {
        self.high_connections + self.normal_connections + self.low_connections
    }
}

impl CacheConfig {
    /// Contention bound as a duration.
    pub fn contention_timeout(&self) -> Duration {
        Duration::from_millis(self.contention_timeout_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero: [(&'static str, u64); 12] = [
            ("database.high_connections", self.database.high_connections as u64),
            ("database.normal_connections", self.database.normal_connections as u64),
            ("database.low_connections", self.database.low_connections as u64),
            ("auth.session_lifespan_secs", self.auth.session_lifespan_secs),
            ("storage.max_read_chunk", self.storage.max_read_chunk as u64),
            ("activity.batch_size", self.activity.batch_size as u64),
            ("limits.connections_per_ip", self.limits.connections_per_ip as u64),
            ("limits.requests_per_minute", self.limits.requests_per_minute as u64),
            (
                "limits.global_requests_per_second",
                self.limits.global_requests_per_second as u64,
            ),
            ("cleanup.interval_secs", self.cleanup.interval_secs),
            ("tls.rollover_history", self.tls.rollover_history as u64),
            ("tls.rollover_nonce_bytes", self.tls.rollover_nonce_bytes as u64),
        ];
        if let Some(&(field, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid {
                field,
                reason: "must be greater than zero".into(),
            });
        }
        if self.tls.enabled && (self.tls.cert_path.is_none() || self.tls.key_path.is_none()) {
            return Err(ConfigError::Invalid {
                field: "tls",
                reason: "cert_path and key_path are required when TLS is enabled".into(),
            });
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid config value {field}: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.server.bind_address, "0.0.0.0:6090");
        assert_eq!(config.database.total_connections(), 14);
        assert_eq!(config.auth.refresh_not_before_secs, 0);
        assert_eq!(config.cache.busy_policy, BusyPolicy::Wait);
        assert_eq!(config.tls.policy, TrustPolicy::Strict);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
[server]
bind_address = "127.0.0.1:7000"
idle_timeout_secs = 10

[database]
path = "/data/vault.db"
low_connections = 1

[storage]
user_max_bytes = 1024

[cache]
busy_policy = "fail_fast"

[tls]
policy = "override"
rollover_history = 5
server_name = "vault.example"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.bind_address, "127.0.0.1:7000");
        assert_eq!(config.server.idle_timeout(), Duration::from_secs(10));
        assert_eq!(config.database.path, PathBuf::from("/data/vault.db"));
        assert_eq!(config.database.low_connections, 1);
        assert_eq!(config.storage.user_max_bytes, 1024);
        assert_eq!(config.cache.busy_policy, BusyPolicy::FailFast);
        assert_eq!(config.tls.policy, TrustPolicy::Override);
        assert_eq!(config.tls.rollover_history, 5);
        assert_eq!(config.tls.server_name, "vault.example");
        assert_eq!(config.tls.rollover_grace_secs, 86_400);
        assert_eq!(config.server.port(), 7000);
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.storage.user_max_files, 1000);
        assert_eq!(config.activity.batch_size, 100);
        assert!(config.http.enabled);
    }

    #[test]
    fn zero_limits_are_rejected() {
        let mut config = Config::default();
        config.limits.requests_per_minute = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("limits.requests_per_minute"));
    }

    #[test]
    fn rollover_needs_history_and_nonce() {
        let mut config = Config::default();
        config.tls.rollover_nonce_bytes = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("tls.rollover_nonce_bytes"));
    }

    #[test]
    fn tls_requires_key_material() {
        let mut config = Config::default();
        config.tls.enabled = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.toml");
        std::fs::write(&path, "[limits]\nconnections_per_ip = 7\n").unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.limits.connections_per_ip, 7);

        let missing = Config::from_file(&dir.path().join("nope.toml"));
        assert!(matches!(missing, Err(ConfigError::ReadError { .. })));
    }
}
