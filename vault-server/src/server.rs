//! Main VaultServer coordination.
//!
//! VaultServer owns every service a request touches, runs the accept loop
//! and starts the background tasks that keep caches and logs durable.

use crate::activity::{ActivityEntry, ActivityLogger, LogAuthor, LogCategory, SqliteSink};
use crate::auth::AuthManager;
use crate::cache::{AmendBuffers, ReadBuffers, StorageCache, Tombstones};
use crate::cleanup;
use crate::config::Config;
use crate::connection::{Connection, ConnectionContext};
use crate::error::Result;
use crate::files::FileStore;
use crate::limits::RateLimits;
use crate::pool::{LeasePool, Priority};
use crate::shutdown::{ShutdownCoordinator, ShutdownReport};
use crate::storage::usage;
use crate::trust::{
    build_acceptor, peer_certificate, rotate_server_certificate, RolloverRecord, TrustError,
    TrustManager, TrustStatus,
};
use sqlx::SqlitePool;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

/// Operational metrics for monitoring server activity.
///
/// All counters are monotonically increasing (reset only on restart).
#[derive(Debug, Default)]
pub struct VaultMetrics {
    /// Total connections accepted.
    pub connections_total: AtomicU64,
    /// Total requests dispatched.
    pub requests_total: AtomicU64,
    /// Total frame bytes received.
    pub bytes_received: AtomicU64,
    /// Total frame bytes sent.
    pub bytes_sent: AtomicU64,
    /// Total rate limit rejections (connection + request + global).
    pub rate_limit_hits: AtomicU64,
    /// Total fault responses (client and server).
    pub errors_total: AtomicU64,
    /// Total connections refused on a trust mismatch.
    pub trust_refusals: AtomicU64,
}

/// The storage server.
pub struct VaultServer {
    config: Config,
    pool: Arc<LeasePool>,
    auth: AuthManager,
    storage: StorageCache,
    read_buffers: ReadBuffers,
    amend_buffers: AmendBuffers,
    tombstones: Tombstones,
    files: FileStore,
    trust: Option<TrustManager>,
    tls: RwLock<Option<TlsAcceptor>>,
    rate_limits: RateLimits,
    activity: ActivityLogger,
    metrics: VaultMetrics,
    coordinator: ShutdownCoordinator,
}

impl std::fmt::Debug for VaultServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultServer")
            .field("config", &self.config)
            .field("auth", &self.auth)
            .field("storage", &self.storage)
            .field("rate_limits", &self.rate_limits)
            .field("metrics", &self.metrics)
            .field("tls", &self.acceptor().is_some())
            .finish_non_exhaustive()
    }
}

impl VaultServer {
    /// Build every service over an open database and start the background
    /// tasks: activity writer, storage flusher and cleanup sweeper.
    pub async fn start(config: Config, db: SqlitePool) -> Result<Arc<Self>> {
        let pool = Arc::new(LeasePool::new(db, &config.database));
        let (activity, writer) =
            ActivityLogger::new(Arc::new(SqliteSink::new(pool.clone())), &config.activity);
        let files = FileStore::open(&config.server.files_directory).await?;

        // Totals flushed before an unclean exit may lag the file table.
        let mut lease = pool.lease(Priority::Low).await?;
        let corrected = usage::reconcile(&mut lease).await?;
        lease.commit().await?;
        if corrected > 0 {
            tracing::info!("Reconciled stored usage for {} users", corrected);
        }

        let (tls, trust) = if config.tls.enabled {
            let acceptor = build_acceptor(&config.tls)?;
            let trust = TrustManager::load(&config.tls.pin_store, config.tls.policy).await?;
            (Some(acceptor), Some(trust))
        } else {
            (None, None)
        };

        let server = Arc::new(Self {
            auth: AuthManager::new(pool.clone(), &config.auth, activity.clone()),
            storage: StorageCache::new(pool.clone(), config.cache.storage_entries, &config.storage),
            read_buffers: ReadBuffers::new(&config.cache),
            amend_buffers: AmendBuffers::new(&config.cache),
            tombstones: Tombstones::new(
                Duration::from_secs(config.cache.tombstone_ttl_secs),
                config.cache.buffer_capacity,
            ),
            files,
            trust,
            tls: RwLock::new(tls),
            rate_limits: RateLimits::new(&config.limits),
            coordinator: ShutdownCoordinator::new(Duration::from_secs(
                config.shutdown.drain_timeout_secs,
            )),
            metrics: VaultMetrics::default(),
            activity,
            pool,
            config,
        });

        server
            .coordinator
            .spawn_background(writer.run(server.coordinator.background_token()));
        server
            .coordinator
            .spawn_background(flush_storage(server.clone()));
        cleanup::spawn_cleanup_task(server.clone());
        if server.config.tls.enabled && server.config.tls.certificate_reload_secs > 0 {
            server
                .coordinator
                .spawn_background(watch_certificate(server.clone()));
        }

        server.activity.log(ActivityEntry::new(
            1,
            LogAuthor::Server,
            LogCategory::Lifecycle,
            "server started",
        ));
        Ok(server)
    }

    /// Get the server configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the lease pool.
    pub fn pool(&self) -> &LeasePool {
        &self.pool
    }

    /// Get the auth manager.
    pub fn auth(&self) -> &AuthManager {
        &self.auth
    }

    /// Get the storage accounting cache.
    pub fn storage(&self) -> &StorageCache {
        &self.storage
    }

    /// Get the chunked-read cursors.
    pub fn read_buffers(&self) -> &ReadBuffers {
        &self.read_buffers
    }

    /// Get the per-file amend slots.
    pub fn amend_buffers(&self) -> &AmendBuffers {
        &self.amend_buffers
    }

    /// Get the deletion tombstones.
    pub fn tombstones(&self) -> &Tombstones {
        &self.tombstones
    }

    /// Get the file store.
    pub fn files(&self) -> &FileStore {
        &self.files
    }

    /// Get the trust manager. `None` when TLS is disabled.
    pub fn trust(&self) -> Option<&TrustManager> {
        self.trust.as_ref()
    }

    fn acceptor(&self) -> Option<TlsAcceptor> {
        self.tls
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Rebuild the TLS acceptor from the configured certificate and key.
    /// Connections already established keep their session.
    pub fn reload_certificate(&self) -> Result<()> {
        let acceptor = build_acceptor(&self.config.tls)?;
        *self.tls.write().unwrap_or_else(PoisonError::into_inner) = Some(acceptor);
        Ok(())
    }

    /// Replace the server certificate, record a signed rollover and start
    /// serving the new certificate.
    pub async fn rotate_certificate(&self, reason: &str) -> Result<RolloverRecord> {
        if !self.config.tls.enabled {
            return Err(TrustError::Tls("TLS is disabled".into()).into());
        }
        let record =
            rotate_server_certificate(&self.config.tls, self.config.server.port(), reason).await?;
        self.reload_certificate()?;
        self.activity.log(ActivityEntry::new(
            3,
            LogAuthor::Trust,
            LogCategory::Security,
            format!("server certificate rotated: {reason}"),
        ));
        Ok(record)
    }

    /// Get access to the rate limiters.
    pub fn rate_limits(&self) -> &RateLimits {
        &self.rate_limits
    }

    /// Get the activity log producer.
    pub fn activity(&self) -> &ActivityLogger {
        &self.activity
    }

    /// Get access to the operational metrics.
    pub fn metrics(&self) -> &VaultMetrics {
        &self.metrics
    }

    /// Get the shutdown coordinator.
    pub fn coordinator(&self) -> &ShutdownCoordinator {
        &self.coordinator
    }

    /// Number of open connections.
    pub fn active_connections(&self) -> usize {
        self.coordinator.active_connections()
    }

    /// Accept connections until shutdown begins.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<()> {
        let cancel = self.coordinator.connection_token();
        tracing::info!("Listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!("Accept failed: {}", e);
                        continue;
                    }
                },
            };

            if let Err(e) = self.rate_limits.check_connection(addr.ip()) {
                tracing::warn!("Connection rate limited for {}: {}", addr, e);
                self.metrics.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let max_connections = self.config.server.max_connections;
            if self.active_connections() >= max_connections {
                tracing::warn!(
                    "Connection limit reached ({}/{}), rejecting {}",
                    self.active_connections(),
                    max_connections,
                    addr
                );
                continue;
            }

            self.metrics.connections_total.fetch_add(1, Ordering::Relaxed);
            let server = self.clone();
            self.coordinator
                .spawn_connection(async move { server.handle_socket(stream, addr).await });
        }

        tracing::info!("Accept loop stopped");
        Ok(())
    }

    async fn handle_socket(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let mut context = ConnectionContext::new(addr);
        let Some(acceptor) = self.acceptor() else {
            Connection::new(self, stream, context).run().await;
            return;
        };

        let handshake = tokio::time::timeout(
            self.config.server.idle_timeout(),
            acceptor.accept(stream),
        )
        .await;
        let stream = match handshake {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::debug!("TLS handshake with {} failed: {}", addr, e);
                return;
            }
            Err(_) => {
                tracing::debug!("TLS handshake with {} timed out", addr);
                return;
            }
        };

        context.peer_certificate = peer_certificate(&stream);
        if let (Some(trust), Some(cert)) = (&self.trust, &context.peer_certificate) {
            match trust.evaluate(&addr.ip().to_string(), cert).await {
                Ok(status) => {
                    if status == TrustStatus::Mismatch {
                        self.activity.log(
                            ActivityEntry::new(
                                4,
                                LogAuthor::Trust,
                                LogCategory::Security,
                                "certificate matches no pin, awaiting rotation proof",
                            )
                            .host(addr.ip()),
                        );
                    }
                    tracing::debug!("Trust for {}: {}", addr, status.as_str());
                    context.trust = Some(status);
                }
                Err(TrustError::InvalidCertificate(e)) => {
                    tracing::warn!("Refusing {}: unparseable certificate: {}", addr, e);
                    return;
                }
                Err(e) => {
                    tracing::error!("Trust evaluation for {} failed: {}", addr, e);
                    return;
                }
            }
        }
        Connection::new(self, stream, context).run().await;
    }

    /// Drain connections, flush caches and logs, then close the pool.
    pub async fn shutdown(&self) -> ShutdownReport {
        let report = self.coordinator.shutdown().await;
        self.pool.close().await;
        report
    }
}

/// Flush dirty storage aggregates on an interval, then once more at high
/// priority when shutdown reaches the background phase.
async fn flush_storage(server: Arc<VaultServer>) {
    let cancel = server.coordinator.background_token();
    let interval_secs = server.config.cache.flush_interval_secs.max(1);
    let mut timer = tokio::time::interval(Duration::from_secs(interval_secs));
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = timer.tick() => {
                match server.storage.flush(Priority::Low).await {
                    Ok(0) => {}
                    Ok(n) => tracing::debug!("Flushed {} storage entries", n),
                    Err(e) => tracing::warn!("Storage flush failed: {}", e),
                }
            }
        }
    }

    match server.storage.flush(Priority::High).await {
        Ok(n) => tracing::info!("Final storage flush wrote {} entries", n),
        Err(e) => tracing::error!("Final storage flush failed: {}", e),
    }
}

/// Pick up a certificate replaced on disk, e.g. by `rotate-cert` run from
/// another process.
async fn watch_certificate(server: Arc<VaultServer>) {
    let Some(path) = server.config.tls.cert_path.clone() else {
        return;
    };
    let cancel = server.coordinator.background_token();
    let mut timer = tokio::time::interval(Duration::from_secs(
        server.config.tls.certificate_reload_secs,
    ));
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut seen = modified(&path).await;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = timer.tick() => {
                let current = modified(&path).await;
                if current == seen {
                    continue;
                }
                seen = current;
                match server.reload_certificate() {
                    Ok(()) => tracing::info!("Reloaded server certificate from {}", path.display()),
                    Err(e) => tracing::warn!("Server certificate reload failed: {}", e),
                }
            }
        }
    }
}

async fn modified(path: &std::path::Path) -> Option<std::time::SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::tests::fast_auth_config;
    use crate::connection::tests::exchange;
    use crate::storage::{self, usage};
    use vault_types::{
        AuthComponent, FileComponent, Operation, Request, RequestBody, ResponseCode,
    };

    pub(crate) fn test_config(dir: &tempfile::TempDir) -> Config {
        let mut config = Config::default();
        config.server.files_directory = dir.path().join("files");
        config.database.path = dir.path().join("vault.db");
        config.auth = fast_auth_config();
        config.shutdown.drain_timeout_secs = 5;
        config
    }

    /// TLS config serving a CA-signed `localhost` certificate. Returns the
    /// CA certificate for clients to trust.
    pub(crate) fn tls_test_config(
        dir: &tempfile::TempDir,
    ) -> (Config, rustls::pki_types::CertificateDer<'static>) {
        let mut ca_params = rcgen::CertificateParams::new(vec!["vault-test-ca".to_string()]).unwrap();
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        ca_params.key_usages.push(rcgen::KeyUsagePurpose::KeyCertSign);
        let ca_key = rcgen::KeyPair::generate().unwrap();
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let leaf_key = rcgen::KeyPair::generate().unwrap();
        let leaf = rcgen::CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .signed_by(&leaf_key, &ca, &ca_key)
            .unwrap();
        let cert_path = dir.path().join("server.pem");
        let key_path = dir.path().join("server.key");
        std::fs::write(&cert_path, leaf.pem()).unwrap();
        std::fs::write(&key_path, leaf_key.serialize_pem()).unwrap();

        let mut config = test_config(dir);
        config.tls.enabled = true;
        config.tls.cert_path = Some(cert_path);
        config.tls.key_path = Some(key_path);
        config.tls.pin_store = dir.path().join("pins.json");
        config.tls.rollover_store = dir.path().join("rollover.json");
        config.tls.certificate_reload_secs = 0;
        (config, ca.der().clone())
    }

    pub(crate) async fn test_server(dir: &tempfile::TempDir) -> Arc<VaultServer> {
        let db = storage::connect_in_memory().await.unwrap();
        VaultServer::start(test_config(dir), db).await.unwrap()
    }

    #[tokio::test]
    async fn serves_heartbeat_over_tcp() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(&dir).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn({
            let server = server.clone();
            async move { server.serve(listener).await }
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let request = Request::new(Operation::Heartbeat, None, RequestBody::Empty).unwrap();
        let response = exchange(&mut client, &request).await;
        assert_eq!(response.code(), Some(ResponseCode::Heartbeat));
        assert_eq!(server.metrics().connections_total.load(Ordering::Relaxed), 1);

        let report = server.shutdown().await;
        assert!(report.is_clean());
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_flushes_usage_and_activity_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let db_path = config.database.path.clone();

        let db = storage::connect(&db_path, 4).await.unwrap();
        let server = VaultServer::start(config, db).await.unwrap();
        let (server_end, mut client) = tokio::io::duplex(64 * 1024);
        let conn = tokio::spawn({
            let server = server.clone();
            async move {
                Connection::new(server, server_end, ConnectionContext::new("127.0.0.1:9".parse().unwrap()))
                    .run()
                    .await
            }
        });

        let unew = Request::new(
            Operation::UserNew,
            Some(AuthComponent::with_password("alice", "password1")),
            RequestBody::Empty,
        )
        .unwrap();
        assert_eq!(exchange(&mut client, &unew).await.code(), Some(ResponseCode::UserCreated));
        let auth = Request::new(
            Operation::Auth,
            Some(AuthComponent::with_password("alice", "password1")),
            RequestBody::Empty,
        )
        .unwrap();
        let session = exchange(&mut client, &auth).await;
        let token = session.body.unwrap()["token"].as_str().unwrap().to_string();

        let upload = Request::new(
            Operation::Upload,
            Some(AuthComponent::with_token("alice", token)),
            RequestBody::File(FileComponent::named("notes.txt").with_data(b"twelve bytes")),
        )
        .unwrap();
        assert_eq!(exchange(&mut client, &upload).await.code(), Some(ResponseCode::FileCreated));
        assert_eq!(server.storage().dirty_count(), 1);

        let report = server.shutdown().await;
        assert!(report.is_clean());
        conn.await.unwrap();
        drop(server);

        let reopened = storage::connect(&db_path, 1).await.unwrap();
        let pool = LeasePool::new(reopened, &crate::config::DatabaseConfig::default());
        let mut lease = pool.lease(Priority::High).await.unwrap();
        let stored = usage::get(&mut lease, "alice").await.unwrap().unwrap();
        assert_eq!(stored.bytes_used, 12);
        assert_eq!(stored.file_count, 1);
        let logged = storage::activity::recent(&mut lease, 100).await.unwrap();
        assert!(logged.iter().any(|row| row.details == "account created"));
        assert!(logged.iter().any(|row| row.details == "server started"));
    }

    #[tokio::test]
    async fn start_reconciles_stale_usage() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let db_path = config.database.path.clone();

        // Usage left behind by a crash between a file write and a flush.
        {
            let db = storage::connect(&db_path, 1).await.unwrap();
            let pool = LeasePool::new(db, &crate::config::DatabaseConfig::default());
            let mut lease = pool.lease(Priority::High).await.unwrap();
            storage::users::insert(&mut lease, "alice", "h").await.unwrap();
            storage::files::insert(&mut lease, "alice", "a.txt", 40).await.unwrap();
            usage::store(&mut lease, "alice", usage::UsageRecord { bytes_used: 0, file_count: 0 })
                .await
                .unwrap();
            lease.commit().await.unwrap();
        }

        let db = storage::connect(&db_path, 4).await.unwrap();
        let server = VaultServer::start(config, db).await.unwrap();
        let mut lease = server.pool().lease(Priority::High).await.unwrap();
        assert_eq!(
            usage::get(&mut lease, "alice").await.unwrap(),
            Some(usage::UsageRecord { bytes_used: 40, file_count: 1 })
        );
        lease.rollback().await.unwrap();
        assert!(server.shutdown().await.is_clean());
    }

    mod tls {
        use super::*;
        use crate::trust::tests::ed25519_cert;
        use crate::trust::{fingerprint, rotation_message};
        use ed25519_dalek::Signer;
        use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
        use tokio_rustls::client::TlsStream;
        use tokio_rustls::TlsConnector;
        use vault_types::InfoComponent;

        struct Peer {
            der: Vec<u8>,
            key: ed25519_dalek::SigningKey,
            connector: TlsConnector,
        }

        impl Peer {
            fn new(seed: u8, ca: &CertificateDer<'static>) -> Self {
                let (cert, key_pair, key) = ed25519_cert(seed);
                let mut roots = rustls::RootCertStore::empty();
                roots.add(ca.clone()).unwrap();
                let client_key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
                let config = rustls::ClientConfig::builder_with_provider(Arc::new(
                    rustls::crypto::ring::default_provider(),
                ))
                .with_safe_default_protocol_versions()
                .unwrap()
                .with_root_certificates(roots)
                .with_client_auth_cert(vec![cert.der().clone()], client_key)
                .unwrap();
                Self {
                    der: cert.der().to_vec(),
                    key,
                    connector: TlsConnector::from(Arc::new(config)),
                }
            }

            async fn connect(&self, addr: SocketAddr) -> std::io::Result<TlsStream<TcpStream>> {
                let tcp = TcpStream::connect(addr).await?;
                let name = ServerName::try_from("localhost").unwrap();
                self.connector.connect(name, tcp).await
            }
        }

        fn heartbeat() -> Request {
            Request::new(Operation::Heartbeat, None, RequestBody::Empty).unwrap()
        }

        #[tokio::test]
        async fn handshake_pins_verifies_refuses_and_rotates() {
            let dir = tempfile::tempdir().unwrap();
            let (config, ca) = tls_test_config(&dir);
            let db = storage::connect_in_memory().await.unwrap();
            let server = VaultServer::start(config, db).await.unwrap();
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let accept = tokio::spawn({
                let server = server.clone();
                async move { server.serve(listener).await }
            });
            let trust = server.trust().unwrap();
            let first = Peer::new(21, &ca);
            let second = Peer::new(22, &ca);

            // First contact pins the certificate.
            let mut stream = first.connect(addr).await.unwrap();
            assert_eq!(exchange(&mut stream, &heartbeat()).await.code(), Some(ResponseCode::Heartbeat));
            drop(stream);
            assert_eq!(trust.history("127.0.0.1").await, vec![fingerprint(&first.der)]);

            // The same certificate is verified on reconnect.
            let mut stream = first.connect(addr).await.unwrap();
            assert_eq!(exchange(&mut stream, &heartbeat()).await.code(), Some(ResponseCode::Heartbeat));
            drop(stream);
            assert_eq!(trust.history("127.0.0.1").await.len(), 1);

            // An unpinned certificate may only rotate.
            let mut stream = second.connect(addr).await.unwrap();
            let response = exchange(&mut stream, &heartbeat()).await;
            assert_eq!(response.code(), Some(ResponseCode::TrustMismatch));
            assert!(response.header.ended_connection);
            drop(stream);

            let mut stream = second.connect(addr).await.unwrap();
            let signature = first.key.sign(&rotation_message(&fingerprint(&second.der)));
            let proof = InfoComponent {
                previous_fingerprint: Some(fingerprint(&first.der)),
                signature: Some(hex::encode(signature.to_bytes())),
                ..InfoComponent::default()
            };
            let rotate = Request::new(Operation::Rotate, None, RequestBody::Info(proof)).unwrap();
            let response = exchange(&mut stream, &rotate).await;
            assert_eq!(response.code(), Some(ResponseCode::Rotated));
            assert_eq!(exchange(&mut stream, &heartbeat()).await.code(), Some(ResponseCode::Heartbeat));
            drop(stream);
            assert_eq!(
                trust.history("127.0.0.1").await,
                vec![fingerprint(&first.der), fingerprint(&second.der)]
            );

            // After a server rotation new handshakes present the self-signed
            // replacement, which the CA no longer vouches for.
            server.rotate_certificate("scheduled").await.unwrap();
            assert!(first.connect(addr).await.is_err());

            server.shutdown().await;
            accept.await.unwrap().unwrap();
        }
    }
}
