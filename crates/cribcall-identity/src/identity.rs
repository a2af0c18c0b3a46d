//! Per-device key pair and self-signed certificate.
//!
//! Generated once on first run and persisted to `identity.json`; reloaded on
//! every subsequent start. A stored blob that fails the fingerprint self-check
//! or structural validation (issuer DN must equal subject DN byte-for-byte,
//! key pair must match the stored public point) is discarded and regenerated.

use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use cribcall_core::storage;
use cribcall_core::types::sha256_hex;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("certificate generation failed: {0}")]
    Generation(String),

    #[error("stored identity is invalid: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// On-disk form of the identity (`identity.json`), all key material base64.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredIdentity {
    device_id: String,
    /// PKCS#8 DER.
    private_key: String,
    /// Uncompressed P-256 point (65 bytes, leading 0x04).
    public_key: String,
    certificate_der: String,
    cert_fingerprint: String,
}

/// The device's long-lived cryptographic identity.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    device_id: String,
    private_key_der: Vec<u8>,
    public_key: Vec<u8>,
    certificate_der: Vec<u8>,
    cert_fingerprint: String,
}

impl DeviceIdentity {
    /// Load the persisted identity from `dir`, or generate and persist a new
    /// one. Fails only if persistent storage itself fails.
    pub async fn load_or_create(dir: &Path) -> Result<Self, IdentityError> {
        let path = identity_path(dir);

        match storage::read_json::<StoredIdentity>(&path).await {
            Ok(Some(stored)) => match Self::from_stored(&stored) {
                Ok(identity) => {
                    info!(
                        "Loaded identity {} (fingerprint {})",
                        identity.device_id,
                        &identity.cert_fingerprint[..16]
                    );
                    return Ok(identity);
                }
                Err(e) => {
                    warn!("Stored identity failed validation ({e}); regenerating");
                }
            },
            Ok(None) => {}
            Err(e) => {
                warn!("Could not read stored identity ({e}); regenerating");
            }
        }

        let identity = Self::generate()?;
        storage::write_json_atomic(&path, &identity.to_stored()).await?;
        info!(
            "Generated new identity {} (fingerprint {})",
            identity.device_id,
            &identity.cert_fingerprint[..16]
        );
        Ok(identity)
    }

    /// Generate a fresh identity (not yet persisted).
    pub fn generate() -> Result<Self, IdentityError> {
        let device_id = uuid::Uuid::new_v4().simple().to_string();
        let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| IdentityError::Generation(e.to_string()))?;

        let mut params = rcgen::CertificateParams::default();
        let mut dn = rcgen::DistinguishedName::new();
        dn.push(rcgen::DnType::CommonName, format!("cribcall-{device_id}"));
        params.distinguished_name = dn;

        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::hours(1);
        params.not_after = now + time::Duration::days(365);

        // Each device is its own trust anchor once pinned by a peer.
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.key_usages = vec![
            rcgen::KeyUsagePurpose::DigitalSignature,
            rcgen::KeyUsagePurpose::KeyCertSign,
        ];
        params.extended_key_usages = vec![
            rcgen::ExtendedKeyUsagePurpose::ServerAuth,
            rcgen::ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.subject_alt_names = vec![rcgen::SanType::URI(
            rcgen::Ia5String::try_from(format!("cribcall:{device_id}"))
                .map_err(|e| IdentityError::Generation(e.to_string()))?,
        )];

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| IdentityError::Generation(e.to_string()))?;

        let certificate_der = cert.der().to_vec();
        let cert_fingerprint = sha256_hex(&certificate_der);

        Ok(Self {
            device_id,
            private_key_der: key_pair.serialize_der(),
            public_key: key_pair.public_key_raw().to_vec(),
            certificate_der,
            cert_fingerprint,
        })
    }

    fn from_stored(stored: &StoredIdentity) -> Result<Self, IdentityError> {
        let decode = |field: &str, b64: &str| {
            STANDARD
                .decode(b64)
                .map_err(|e| IdentityError::Invalid(format!("{field}: {e}")))
        };
        let private_key_der = decode("privateKey", &stored.private_key)?;
        let public_key = decode("publicKey", &stored.public_key)?;
        let certificate_der = decode("certificateDer", &stored.certificate_der)?;

        let identity = Self {
            device_id: stored.device_id.clone(),
            private_key_der,
            public_key,
            certificate_der,
            cert_fingerprint: stored.cert_fingerprint.clone(),
        };
        identity.validate()?;
        Ok(identity)
    }

    /// Self-check: fingerprint, issuer == subject, key pair consistency.
    pub fn validate(&self) -> Result<(), IdentityError> {
        if sha256_hex(&self.certificate_der) != self.cert_fingerprint {
            return Err(IdentityError::Invalid("fingerprint mismatch".into()));
        }

        let (_, cert) = x509_parser::parse_x509_certificate(&self.certificate_der)
            .map_err(|e| IdentityError::Invalid(format!("certificate parse: {e}")))?;
        let tbs = &cert.tbs_certificate;
        if tbs.issuer.as_raw() != tbs.subject.as_raw() {
            return Err(IdentityError::Invalid("issuer DN != subject DN".into()));
        }

        let key_pair = rcgen::KeyPair::try_from(self.private_key_der.as_slice())
            .map_err(|e| IdentityError::Invalid(format!("private key parse: {e}")))?;
        if key_pair.public_key_raw() != self.public_key {
            return Err(IdentityError::Invalid("public key does not match key pair".into()));
        }

        if self.public_key.first() != Some(&0x04) || self.public_key.len() != 65 {
            return Err(IdentityError::Invalid("public key is not an uncompressed P-256 point".into()));
        }
        Ok(())
    }

    fn to_stored(&self) -> StoredIdentity {
        StoredIdentity {
            device_id: self.device_id.clone(),
            private_key: STANDARD.encode(&self.private_key_der),
            public_key: STANDARD.encode(&self.public_key),
            certificate_der: STANDARD.encode(&self.certificate_der),
            cert_fingerprint: self.cert_fingerprint.clone(),
        }
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Lowercase hex SHA-256 of the certificate DER (64 chars).
    pub fn cert_fingerprint(&self) -> &str {
        &self.cert_fingerprint
    }

    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate_der
    }

    /// Uncompressed P-256 public point (65 bytes).
    pub fn public_key_uncompressed(&self) -> &[u8] {
        &self.public_key
    }

    pub fn public_key_base64(&self) -> String {
        STANDARD.encode(&self.public_key)
    }

    // ── TLS stack material ────────────────────────────────────────────────────

    pub fn tls_certificate(&self) -> CertificateDer<'static> {
        CertificateDer::from(self.certificate_der.clone())
    }

    pub fn tls_private_key(&self) -> Result<PrivateKeyDer<'static>, IdentityError> {
        PrivateKeyDer::try_from(self.private_key_der.clone())
            .map_err(|e| IdentityError::Invalid(format!("private key: {e}")))
    }

    // ── PEM export ────────────────────────────────────────────────────────────

    pub fn certificate_pem(&self) -> String {
        pem_wrap("CERTIFICATE", &self.certificate_der)
    }

    /// PKCS#8 PEM.
    pub fn private_key_pem(&self) -> String {
        pem_wrap("PRIVATE KEY", &self.private_key_der)
    }
}

fn identity_path(dir: &Path) -> PathBuf {
    dir.join(storage::IDENTITY_FILE)
}

fn pem_wrap(label: &str, der: &[u8]) -> String {
    let b64 = STANDARD.encode(der);
    let mut out = format!("-----BEGIN {label}-----\n");
    for chunk in b64.as_bytes().chunks(64) {
        out.push_str(std::str::from_utf8(chunk).expect("base64 is ASCII"));
        out.push('\n');
    }
    out.push_str(&format!("-----END {label}-----\n"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_identity_passes_self_check() {
        let identity = DeviceIdentity::generate().unwrap();
        identity.validate().unwrap();
        assert_eq!(identity.cert_fingerprint().len(), 64);
        assert_eq!(identity.public_key_uncompressed().len(), 65);
        assert_eq!(identity.public_key_uncompressed()[0], 0x04);
    }

    #[test]
    fn certificate_profile_matches_contract() {
        let identity = DeviceIdentity::generate().unwrap();
        let (_, cert) = x509_parser::parse_x509_certificate(identity.certificate_der()).unwrap();
        let tbs = &cert.tbs_certificate;

        assert_eq!(tbs.issuer.as_raw(), tbs.subject.as_raw());
        let cn = tbs
            .subject
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap();
        assert_eq!(cn, format!("cribcall-{}", identity.device_id()));

        let bc = tbs.basic_constraints().unwrap().unwrap();
        assert!(bc.critical);
        assert!(bc.value.ca);

        let ku = tbs.key_usage().unwrap().unwrap();
        assert!(ku.critical);
        assert!(ku.value.digital_signature());
        assert!(ku.value.key_cert_sign());

        let eku = tbs.extended_key_usage().unwrap().unwrap();
        assert!(eku.value.server_auth);
        assert!(eku.value.client_auth);
    }

    #[test]
    fn pem_export_has_expected_framing() {
        let identity = DeviceIdentity::generate().unwrap();
        let cert_pem = identity.certificate_pem();
        assert!(cert_pem.starts_with("-----BEGIN CERTIFICATE-----\n"));
        assert!(cert_pem.ends_with("-----END CERTIFICATE-----\n"));
        let key_pem = identity.private_key_pem();
        assert!(key_pem.contains("BEGIN PRIVATE KEY"));
    }

    #[tokio::test]
    async fn load_or_create_is_stable_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let first = DeviceIdentity::load_or_create(dir.path()).await.unwrap();
        let second = DeviceIdentity::load_or_create(dir.path()).await.unwrap();
        assert_eq!(first.device_id(), second.device_id());
        assert_eq!(first.cert_fingerprint(), second.cert_fingerprint());
    }

    #[tokio::test]
    async fn corrupted_blob_is_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        let first = DeviceIdentity::load_or_create(dir.path()).await.unwrap();

        // Flip the stored fingerprint so the self-check fails.
        let path = dir.path().join(storage::IDENTITY_FILE);
        let mut blob: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        blob["certFingerprint"] = serde_json::Value::String("00".repeat(32));
        std::fs::write(&path, serde_json::to_vec(&blob).unwrap()).unwrap();

        let second = DeviceIdentity::load_or_create(dir.path()).await.unwrap();
        assert_ne!(first.cert_fingerprint(), second.cert_fingerprint());
        second.validate().unwrap();
    }

    #[tokio::test]
    async fn unreadable_blob_is_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(storage::IDENTITY_FILE), b"not json").unwrap();
        let identity = DeviceIdentity::load_or_create(dir.path()).await.unwrap();
        identity.validate().unwrap();
    }
}
