//! Server certificate rotation.
//!
//! Rotating replaces the server's certificate and key with a fresh
//! self-signed ed25519 pair and records a rollover: the old certificate,
//! SHA-256 hashes of both SubjectPublicKeyInfos, a random nonce and a
//! signature by the old key over `old_hash ‖ new_hash ‖ nonce`. Clients that
//! pinned the old certificate fetch the records with an unauthenticated
//! rollover query and move their pin once the signature checks out.
//!
//! Records are kept in insertion order and trimmed to the configured
//! history, so the store never grows past `tls.rollover_history` entries.

use super::tls::load_identity;
use super::{fingerprint, TrustError, TrustResult};
use crate::config::TlsConfig;
use rustls::crypto::ring::sign::any_supported_type;
use rustls::sign::{Signer, SigningKey};
use rustls::SignatureScheme;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use x509_parser::prelude::{FromDer, X509Certificate};

/// Schemes the old key may sign a rollover with, in order of preference.
const ROLLOVER_SCHEMES: &[SignatureScheme] = &[
    SignatureScheme::ED25519,
    SignatureScheme::ECDSA_NISTP256_SHA256,
    SignatureScheme::ECDSA_NISTP384_SHA384,
    SignatureScheme::RSA_PSS_SHA256,
];

/// One signed certificate rollover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloverRecord {
    /// SHA-256 fingerprint of the replaced certificate.
    pub old_fingerprint: String,
    /// Name the new certificate was issued for.
    pub hostname: String,
    /// Listener port.
    pub port: u16,
    /// Hex DER of the replaced certificate.
    pub old_certificate: String,
    /// SHA-256 of the replaced certificate's SubjectPublicKeyInfo.
    pub old_pubkey_hash: String,
    /// SHA-256 of the new certificate's SubjectPublicKeyInfo.
    pub new_pubkey_hash: String,
    /// Unix seconds.
    pub issued_at: u64,
    /// Unix seconds after which clients should no longer honour the record.
    pub valid_until: u64,
    /// Operator-supplied reason.
    pub reason: String,
    /// TLS signature scheme of `signature`.
    pub signature_scheme: String,
    /// Hex signature by the old key.
    pub signature: String,
    /// Hex nonce.
    pub nonce: String,
}

impl RolloverRecord {
    /// The bytes `signature` covers.
    pub fn signed_message(&self) -> TrustResult<Vec<u8>> {
        let mut message = Vec::new();
        for part in [&self.old_pubkey_hash, &self.new_pubkey_hash, &self.nonce] {
            let bytes = hex::decode(part)
                .map_err(|e| TrustError::Tls(format!("malformed rollover record: {e}")))?;
            message.extend_from_slice(&bytes);
        }
        Ok(message)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RolloverFile {
    #[serde(default)]
    records: Vec<RolloverRecord>,
}

/// SHA-256 hex of a certificate's DER SubjectPublicKeyInfo.
pub fn public_key_hash(cert_der: &[u8]) -> TrustResult<String> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| TrustError::InvalidCertificate(e.to_string()))?;
    Ok(hex::encode(Sha256::digest(cert.public_key().raw)))
}

/// Stored rollover records, oldest first. A missing store is empty.
pub async fn load_rollover(path: &Path) -> TrustResult<Vec<RolloverRecord>> {
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.is_empty() => Ok(Vec::new()),
        Ok(bytes) => Ok(serde_json::from_slice::<RolloverFile>(&bytes)?.records),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Records keyed by the fingerprint of the certificate each one replaced.
pub fn rollover_data(records: &[RolloverRecord]) -> serde_json::Map<String, serde_json::Value> {
    records
        .iter()
        .filter_map(|r| Some((r.old_fingerprint.clone(), serde_json::to_value(r).ok()?)))
        .collect()
}

/// Replace the certificate and key named by `config` and record the
/// rollover. The new files are in place when this returns; a running
/// listener needs its acceptor rebuilt to serve them.
pub async fn rotate_server_certificate(
    config: &TlsConfig,
    port: u16,
    reason: &str,
) -> TrustResult<RolloverRecord> {
    let (cert_path, key_path) = match (&config.cert_path, &config.key_path) {
        (Some(cert), Some(key)) => (cert.clone(), key.clone()),
        _ => return Err(TrustError::Tls("tls.cert_path and tls.key_path must be set".into())),
    };
    let (chain, old_key) = load_identity(config)?;
    let old_der = chain[0].as_ref();

    let signer = any_supported_type(&old_key)
        .map_err(|e| TrustError::Tls(format!("unusable server key: {e}")))?
        .choose_scheme(ROLLOVER_SCHEMES)
        .ok_or_else(|| TrustError::Tls("server key cannot sign rollover records".into()))?;

    let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ED25519).map_err(generation)?;
    let mut params =
        rcgen::CertificateParams::new(vec![config.server_name.clone()]).map_err(generation)?;
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, config.server_name.as_str());
    let new_cert = params.self_signed(&key_pair).map_err(generation)?;

    let mut nonce = vec![0u8; config.rollover_nonce_bytes];
    getrandom::getrandom(&mut nonce).map_err(|e| TrustError::Tls(format!("nonce: {e}")))?;

    let issued_at = crate::auth::current_timestamp();
    let mut record = RolloverRecord {
        old_fingerprint: fingerprint(old_der),
        hostname: config.server_name.clone(),
        port,
        old_certificate: hex::encode(old_der),
        old_pubkey_hash: public_key_hash(old_der)?,
        new_pubkey_hash: public_key_hash(new_cert.der())?,
        issued_at,
        valid_until: issued_at.saturating_add(config.rollover_grace_secs),
        reason: reason.to_string(),
        signature_scheme: format!("{:?}", signer.scheme()),
        signature: String::new(),
        nonce: hex::encode(&nonce),
    };
    let signature = signer
        .sign(&record.signed_message()?)
        .map_err(|e| TrustError::Tls(format!("rollover signature: {e}")))?;
    record.signature = hex::encode(signature);

    // Key before certificate: a reload is triggered by the certificate.
    write_atomic(&key_path, key_pair.serialize_pem().as_bytes(), true).await?;
    write_atomic(&cert_path, new_cert.pem().as_bytes(), false).await?;

    let mut records = load_rollover(&config.rollover_store).await?;
    let keep = config.rollover_history.saturating_sub(1);
    if records.len() > keep {
        records.drain(..records.len() - keep);
    }
    records.push(record.clone());
    let json = serde_json::to_vec_pretty(&RolloverFile { records })?;
    write_atomic(&config.rollover_store, &json, false).await?;

    tracing::info!(
        "Rotated server certificate {} -> {} ({})",
        record.old_fingerprint,
        fingerprint(new_cert.der()),
        reason
    );
    Ok(record)
}

fn generation(e: rcgen::Error) -> TrustError {
    TrustError::Tls(format!("certificate generation: {e}"))
}

async fn write_atomic(path: &Path, contents: &[u8], secret: bool) -> TrustResult<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);
    tokio::fs::write(&tmp, contents).await?;
    if secret {
        restrict(&tmp).await?;
    }
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(unix)]
async fn restrict(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
}

#[cfg(not(unix))]
async fn restrict(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
