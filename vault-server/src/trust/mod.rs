//! Trust-on-first-use peer pinning.
//!
//! The first certificate a peer presents is pinned. Later connections must
//! present a certificate from the peer's pin history, or prove a rotation:
//! an ed25519 signature, made with the key of a previously pinned
//! certificate, over [`ROTATION_CONTEXT`] followed by the new fingerprint.
//!
//! ```text
//! UNKNOWN ──first contact──▶ PINNED
//! PINNED  ──history match──▶ VERIFIED
//!         ──valid proof────▶ ROTATED   (fingerprint appended)
//!         ──otherwise──────▶ MISMATCH  (refused, or re-pinned under override)
//! ```
//!
//! Certificates are parsed with `x509-parser`; only the subject public key
//! of an `id-Ed25519` SubjectPublicKeyInfo can sign a rotation.
//!
//! The pin store is a JSON file rewritten atomically on every change, so
//! history survives restarts.

mod rollover;
mod tls;

pub use rollover::{
    load_rollover, public_key_hash, rollover_data, rotate_server_certificate, RolloverRecord,
};
pub use tls::{build_acceptor, peer_certificate};

use crate::config::TrustPolicy;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use x509_parser::oid_registry::OID_SIG_ED25519;
use x509_parser::prelude::{FromDer, X509Certificate};

/// Domain separation prefix for rotation signatures.
pub const ROTATION_CONTEXT: &[u8] = b"strata-trust-rotation-v1:";

/// Trust store errors.
#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    /// Pin store could not be read or written.
    #[error("pin store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Pin store is not valid JSON.
    #[error("pin store is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    /// Rotation names a fingerprint the peer never pinned.
    #[error("previous fingerprint is not in the peer's history")]
    UnknownPrevious,

    /// The previous certificate's key cannot verify a rotation.
    #[error("previous certificate has a {algorithm} key, rotation needs ed25519")]
    NoRotationKey {
        /// Dotted OID of the pinned key's algorithm, or "unknown".
        algorithm: String,
    },

    /// Not a parseable X.509 certificate.
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    /// Signature did not verify.
    #[error("rotation signature is invalid")]
    BadSignature,

    /// TLS setup failure.
    #[error("TLS error: {0}")]
    Tls(String),
}

/// Result type alias for trust operations.
pub type TrustResult<T> = std::result::Result<T, TrustError>;

/// Outcome of evaluating a peer certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustStatus {
    /// First contact; the certificate is now pinned.
    Pinned,
    /// Matches a pinned certificate.
    Verified,
    /// Accepted through a rotation proof.
    Rotated,
    /// Unknown certificate, refused until a rotation proof arrives.
    Mismatch,
    /// Unknown certificate, re-pinned because the override policy is active.
    Overridden,
}

impl TrustStatus {
    /// Whether the peer may issue ordinary requests.
    pub fn is_trusted(self) -> bool {
        !matches!(self, TrustStatus::Mismatch)
    }

    /// Label used in logs and queries.
    pub fn as_str(self) -> &'static str {
        match self {
            TrustStatus::Pinned => "pinned",
            TrustStatus::Verified => "verified",
            TrustStatus::Rotated => "rotated",
            TrustStatus::Mismatch => "mismatch",
            TrustStatus::Overridden => "overridden",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Pin {
    fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key_algorithm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    public_key: Option<String>,
    pinned_at: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PinFile {
    #[serde(default)]
    peers: HashMap<String, Vec<Pin>>,
}

/// Persistent TOFU pin store.
pub struct TrustManager {
    path: PathBuf,
    policy: TrustPolicy,
    pins: Mutex<PinFile>,
}

impl std::fmt::Debug for TrustManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustManager")
            .field("path", &self.path)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl TrustManager {
    /// Load the pin store at `path`, starting empty if it does not exist.
    pub async fn load(path: impl Into<PathBuf>, policy: TrustPolicy) -> TrustResult<Self> {
        let path = path.into();
        let pins = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PinFile::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            policy,
            pins: Mutex::new(pins),
        })
    }

    /// Decide whether to trust `peer` presenting `cert_der`.
    pub async fn evaluate(&self, peer: &str, cert_der: &[u8]) -> TrustResult<TrustStatus> {
        let key = SubjectKey::parse(cert_der)?;
        let fp = fingerprint(cert_der);
        let mut pins = self.pins.lock().await;

        let status = match pins.peers.get_mut(peer) {
            None => {
                pins.peers.insert(peer.to_string(), vec![new_pin(fp, &key)]);
                TrustStatus::Pinned
            }
            Some(history) if history.iter().any(|p| p.fingerprint == fp) => {
                return Ok(TrustStatus::Verified);
            }
            Some(history) => match self.policy {
                TrustPolicy::Strict => return Ok(TrustStatus::Mismatch),
                TrustPolicy::Override => {
                    history.push(new_pin(fp, &key));
                    TrustStatus::Overridden
                }
            },
        };
        persist(&self.path, &pins).await?;
        Ok(status)
    }

    /// Accept `new_cert` for `peer` on a signature by a previously pinned key.
    pub async fn rotate(
        &self,
        peer: &str,
        new_cert: &[u8],
        previous_fingerprint: &str,
        signature_hex: &str,
    ) -> TrustResult<TrustStatus> {
        let new_key = SubjectKey::parse(new_cert)?;
        let new_fp = fingerprint(new_cert);
        let mut pins = self.pins.lock().await;
        let history = pins
            .peers
            .get_mut(peer)
            .ok_or(TrustError::UnknownPrevious)?;
        if history.iter().any(|p| p.fingerprint == new_fp) {
            return Ok(TrustStatus::Verified);
        }
        let previous = history
            .iter()
            .find(|p| p.fingerprint.eq_ignore_ascii_case(previous_fingerprint))
            .ok_or(TrustError::UnknownPrevious)?;
        let key = previous
            .public_key
            .as_deref()
            .and_then(|k| hex::decode(k).ok())
            .and_then(|k| <[u8; 32]>::try_from(k).ok())
            .and_then(|k| VerifyingKey::from_bytes(&k).ok())
            .ok_or_else(|| TrustError::NoRotationKey {
                algorithm: previous
                    .key_algorithm
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
            })?;
        let signature = hex::decode(signature_hex)
            .ok()
            .and_then(|s| Signature::from_slice(&s).ok())
            .ok_or(TrustError::BadSignature)?;
        key.verify(&rotation_message(&new_fp), &signature)
            .map_err(|_| TrustError::BadSignature)?;

        history.push(new_pin(new_fp, &new_key));
        persist(&self.path, &pins).await?;
        Ok(TrustStatus::Rotated)
    }

    /// Fingerprints pinned for a peer, oldest first.
    pub async fn history(&self, peer: &str) -> Vec<String> {
        self.pins
            .lock()
            .await
            .peers
            .get(peer)
            .map(|h| h.iter().map(|p| p.fingerprint.clone()).collect())
            .unwrap_or_default()
    }
}

/// Lowercase hex SHA-256 of a DER certificate.
pub fn fingerprint(cert_der: &[u8]) -> String {
    hex::encode(Sha256::digest(cert_der))
}

/// Message a rotation signature covers.
pub fn rotation_message(new_fingerprint: &str) -> Vec<u8> {
    let mut message = ROTATION_CONTEXT.to_vec();
    message.extend_from_slice(new_fingerprint.as_bytes());
    message
}

/// Subject public key of a certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectKey {
    /// Dotted OID of the key algorithm.
    pub algorithm: String,
    /// The SubjectPublicKeyInfo bit string contents.
    pub bytes: Vec<u8>,
    ed25519: bool,
}

impl SubjectKey {
    /// Parse `cert_der` and take its SubjectPublicKeyInfo.
    pub fn parse(cert_der: &[u8]) -> TrustResult<Self> {
        let (_, cert) = X509Certificate::from_der(cert_der)
            .map_err(|e| TrustError::InvalidCertificate(e.to_string()))?;
        let spki = cert.public_key();
        Ok(Self {
            algorithm: spki.algorithm.algorithm.to_id_string(),
            bytes: spki.subject_public_key.data.to_vec(),
            ed25519: spki.algorithm.algorithm == OID_SIG_ED25519,
        })
    }

    /// The key as ed25519, when that is its algorithm.
    pub fn ed25519(&self) -> Option<[u8; 32]> {
        if !self.ed25519 {
            return None;
        }
        self.bytes.as_slice().try_into().ok()
    }
}

/// The ed25519 subject public key of a certificate, if it has one.
pub fn ed25519_key(cert_der: &[u8]) -> Option<[u8; 32]> {
    SubjectKey::parse(cert_der).ok()?.ed25519()
}

fn new_pin(fingerprint: String, key: &SubjectKey) -> Pin {
    Pin {
        fingerprint,
        key_algorithm: Some(key.algorithm.clone()),
        public_key: key.ed25519().map(hex::encode),
        pinned_at: crate::auth::current_timestamp(),
    }
}

async fn persist(path: &Path, pins: &PinFile) -> TrustResult<()> {
    let json = serde_json::to_vec_pretty(pins)?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
