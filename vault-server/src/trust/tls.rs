//! TLS acceptor with trust-on-first-use client certificates.
//!
//! Client certificates are not chained to any CA. The handshake only proves
//! the peer holds the key for the certificate it presented; whether that
//! certificate is trusted is decided afterwards by the
//! [`TrustManager`](super::TrustManager).

use super::{TrustError, TrustResult};
use crate::config::TlsConfig;
use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme};
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Accepts any well-formed client certificate and checks handshake
/// signatures against it.
#[derive(Debug)]
struct PinningClientVerifier {
    mandatory: bool,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ClientCertVerifier for PinningClientVerifier {
    fn client_auth_mandatory(&self) -> bool {
        self.mandatory
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

fn read_pem(path: &Path) -> TrustResult<Vec<u8>> {
    std::fs::read(path).map_err(|e| TrustError::Tls(format!("cannot read {}: {e}", path.display())))
}

/// Certificate chain and private key named by `[tls]`.
pub(super) fn load_identity(
    config: &TlsConfig,
) -> TrustResult<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_path = config
        .cert_path
        .as_deref()
        .ok_or_else(|| TrustError::Tls("tls.cert_path not set".into()))?;
    let key_path = config
        .key_path
        .as_deref()
        .ok_or_else(|| TrustError::Tls("tls.key_path not set".into()))?;

    let cert_pem = read_pem(cert_path)?;
    let certs = CertificateDer::pem_slice_iter(&cert_pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TrustError::Tls(format!("invalid certificate: {e}")))?;
    if certs.is_empty() {
        return Err(TrustError::Tls("no certificates found".into()));
    }
    let key = PrivateKeyDer::from_pem_slice(&read_pem(key_path)?)
        .map_err(|e| TrustError::Tls(format!("invalid private key: {e}")))?;
    Ok((certs, key))
}

/// Build the server-side acceptor from `[tls]`.
pub fn build_acceptor(config: &TlsConfig) -> TrustResult<TlsAcceptor> {
    let (certs, key) = load_identity(config)?;
    let provider = Arc::new(ring::default_provider());
    let verifier = PinningClientVerifier {
        mandatory: config.require_peer_certificate,
        algorithms: provider.signature_verification_algorithms,
    };
    let server_config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TrustError::Tls(format!("protocol versions: {e}")))?
        .with_client_cert_verifier(Arc::new(verifier))
        .with_single_cert(certs, key)
        .map_err(|e| TrustError::Tls(format!("server config error: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// DER of the end-entity certificate a TLS peer presented.
pub fn peer_certificate<IO>(stream: &tokio_rustls::server::TlsStream<IO>) -> Option<Vec<u8>> {
    stream
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|chain| chain.first())
        .map(|cert| cert.as_ref().to_vec())
}
