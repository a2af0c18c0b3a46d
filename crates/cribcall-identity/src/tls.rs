//! rustls plumbing for pinned-fingerprint trust.
//!
//! Certificates are never chased to a CA: a peer is acceptable iff the
//! SHA-256 of its leaf DER is pinned. The server-side verifier reads the live
//! trust snapshot so a trust-store change re-evaluates the acceptance set
//! without restarting the listener. Validity windows are not re-checked here;
//! the fingerprint match is the trust criterion.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::DistinguishedName;
use tracing::{debug, warn};

use cribcall_core::types::{sha256_hex, TrustedPeer};

use crate::identity::{DeviceIdentity, IdentityError};

/// Install the ring crypto provider as the process-level default.
/// Required by rustls 0.23+ before any config is built; the error on a
/// second install is ignored.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

// ── Acceptance set ────────────────────────────────────────────────────────────

/// The set of client certificates the control server will handshake with:
/// every trusted peer, plus explicitly seeded known-untrusted fingerprints
/// (a pairing/test seam — nothing in the production wiring seeds it).
pub struct TlsAcceptance {
    trusted: Arc<RwLock<HashMap<String, TrustedPeer>>>,
    known_untrusted: RwLock<HashSet<String>>,
}

impl TlsAcceptance {
    /// Build over a trust store's committed-state snapshot.
    pub fn new(trusted: Arc<RwLock<HashMap<String, TrustedPeer>>>) -> Arc<Self> {
        Arc::new(Self {
            trusted,
            known_untrusted: RwLock::new(HashSet::new()),
        })
    }

    /// Admit a specific unknown fingerprint for this process only.
    pub fn allow_untrusted(&self, fingerprint: &str) {
        self.known_untrusted
            .write()
            .expect("acceptance lock poisoned")
            .insert(fingerprint.to_owned());
    }

    pub fn is_trusted(&self, fingerprint: &str) -> bool {
        self.trusted
            .read()
            .expect("trust snapshot lock poisoned")
            .contains_key(fingerprint)
    }

    pub fn is_acceptable(&self, fingerprint: &str) -> bool {
        self.is_trusted(fingerprint)
            || self
                .known_untrusted
                .read()
                .expect("acceptance lock poisoned")
                .contains(fingerprint)
    }
}

impl std::fmt::Debug for TlsAcceptance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsAcceptance").finish_non_exhaustive()
    }
}

// ── Server side: fingerprint-pinned client verifier ──────────────────────────

/// Accepts a client certificate iff its fingerprint is in the acceptance set.
/// Client auth is offered but not mandatory so `/health` stays reachable
/// without a certificate; trust classification happens at the application
/// layer from the presented (or absent) certificate.
#[derive(Debug)]
struct FingerprintClientVerifier {
    acceptance: Arc<TlsAcceptance>,
}

impl rustls::server::danger::ClientCertVerifier for FingerprintClientVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        let fingerprint = sha256_hex(end_entity.as_ref());
        if self.acceptance.is_acceptable(&fingerprint) {
            debug!("Accepted client certificate {}", &fingerprint[..16]);
            Ok(rustls::server::danger::ClientCertVerified::assertion())
        } else {
            warn!("Rejected unknown client certificate {}", &fingerprint[..16]);
            Err(rustls::Error::General("unknown client certificate".into()))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }
}

// ── Client side: pinned server verifier ───────────────────────────────────────

/// Verifies the server leaf by pinned fingerprint, recording the observed
/// leaf either way (the pairing client stores it on PAIR_ACCEPTED).
///
/// With no pin set, any self-signed leaf is accepted — used only while
/// pairing, where the PAKE transcript and comparison code carry the trust
/// decision instead.
#[derive(Debug)]
pub struct PinnedServerVerifier {
    expected_fingerprint: Option<String>,
    observed_leaf: Mutex<Option<Vec<u8>>>,
}

impl PinnedServerVerifier {
    pub fn pinned(expected_fingerprint: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            expected_fingerprint: Some(expected_fingerprint.into()),
            observed_leaf: Mutex::new(None),
        })
    }

    pub fn observe_only() -> Arc<Self> {
        Arc::new(Self {
            expected_fingerprint: None,
            observed_leaf: Mutex::new(None),
        })
    }

    /// The leaf DER seen during the last handshake.
    pub fn observed_leaf(&self) -> Option<Vec<u8>> {
        self.observed_leaf
            .lock()
            .expect("observed leaf lock poisoned")
            .clone()
    }

    pub fn observed_fingerprint(&self) -> Option<String> {
        self.observed_leaf().map(|der| sha256_hex(&der))
    }
}

impl rustls::client::danger::ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let fingerprint = sha256_hex(end_entity.as_ref());
        *self
            .observed_leaf
            .lock()
            .expect("observed leaf lock poisoned") = Some(end_entity.as_ref().to_vec());

        match &self.expected_fingerprint {
            Some(expected) if *expected != fingerprint => {
                warn!(
                    "Server fingerprint mismatch: expected {}, got {}",
                    &expected[..16.min(expected.len())],
                    &fingerprint[..16]
                );
                Err(rustls::Error::General("fingerprint_mismatch".into()))
            }
            _ => Ok(rustls::client::danger::ServerCertVerified::assertion()),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

// ── Config builders ───────────────────────────────────────────────────────────

/// Control-port server config: our certificate, client certs verified by
/// fingerprint against `acceptance`.
pub fn mtls_server_config(
    identity: &DeviceIdentity,
    acceptance: Arc<TlsAcceptance>,
) -> Result<Arc<rustls::ServerConfig>, IdentityError> {
    install_crypto_provider();
    let config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(FingerprintClientVerifier { acceptance }))
        .with_single_cert(vec![identity.tls_certificate()], identity.tls_private_key()?)
        .map_err(|e| IdentityError::Invalid(format!("server config: {e}")))?;
    Ok(Arc::new(config))
}

/// Accepts any presented client certificate without requiring one.
///
/// Used only on the pairing port, where listeners are by definition not yet
/// trusted: the certificate is merely observed so its DER can be pinned once
/// the PAKE handshake and user confirmation succeed.
#[derive(Debug)]
struct ObservingClientVerifier;

impl rustls::server::danger::ClientCertVerifier for ObservingClientVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }
}

/// Pairing-port server config: our certificate; client certificates are
/// requested and observed but never required or validated (listeners are not
/// yet trusted when they arrive here).
pub fn pairing_server_config(
    identity: &DeviceIdentity,
) -> Result<Arc<rustls::ServerConfig>, IdentityError> {
    install_crypto_provider();
    let config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(ObservingClientVerifier))
        .with_single_cert(vec![identity.tls_certificate()], identity.tls_private_key()?)
        .map_err(|e| IdentityError::Invalid(format!("server config: {e}")))?;
    Ok(Arc::new(config))
}

/// Client config with the given server verifier, optionally presenting our
/// identity certificate.
pub fn client_config(
    identity: Option<&DeviceIdentity>,
    verifier: Arc<PinnedServerVerifier>,
) -> Result<Arc<rustls::ClientConfig>, IdentityError> {
    install_crypto_provider();
    let builder = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier);

    let config = match identity {
        Some(identity) => builder
            .with_client_auth_cert(vec![identity.tls_certificate()], identity.tls_private_key()?)
            .map_err(|e| IdentityError::Invalid(format!("client config: {e}")))?,
        None => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

/// Build a rustls `ServerName` for SNI from a host string (IP or DNS name).
pub fn server_name(host: &str) -> Result<ServerName<'static>, IdentityError> {
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        Ok(ServerName::IpAddress(ip.into()))
    } else {
        ServerName::try_from(host.to_owned())
            .map_err(|_| IdentityError::Invalid(format!("invalid hostname: {host}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_with(fp: &str) -> Arc<RwLock<HashMap<String, TrustedPeer>>> {
        let peer = TrustedPeer::new("id", "Peer", fp, None);
        Arc::new(RwLock::new(HashMap::from([(fp.to_owned(), peer)])))
    }

    #[test]
    fn acceptance_follows_snapshot() {
        let snapshot = snapshot_with("fp-a");
        let acceptance = TlsAcceptance::new(Arc::clone(&snapshot));
        assert!(acceptance.is_trusted("fp-a"));
        assert!(!acceptance.is_acceptable("fp-x"));

        // Trust-store commit → acceptance re-evaluates without rebuild.
        snapshot.write().unwrap().remove("fp-a");
        assert!(!acceptance.is_acceptable("fp-a"));
    }

    #[test]
    fn known_untrusted_is_acceptable_but_not_trusted() {
        let acceptance = TlsAcceptance::new(Arc::new(RwLock::new(HashMap::new())));
        acceptance.allow_untrusted("fp-u");
        assert!(acceptance.is_acceptable("fp-u"));
        assert!(!acceptance.is_trusted("fp-u"));
    }

    #[test]
    fn pinned_verifier_records_observed_leaf() {
        let verifier = PinnedServerVerifier::observe_only();
        assert!(verifier.observed_leaf().is_none());
        assert!(verifier.observed_fingerprint().is_none());
    }
}
