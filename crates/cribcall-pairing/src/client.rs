//! Listener-side pairing flow.
//!
//! Split in two steps because the PIN only exists once the monitor has
//! created the session: [`PairingClient::begin`] sends PIN_PAIRING_INIT and
//! returns a [`PairingHandshake`]; the caller obtains the PIN from the human
//! and finishes with [`PairingHandshake::submit_pin`].

use std::sync::Arc;

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tokio::net::TcpStream;
use tracing::{debug, info};
use x25519_dalek::{PublicKey, StaticSecret};

use cribcall_control::http::HttpConnection;
use cribcall_core::canonical::hmac_tag;
use cribcall_core::types::{sha256_hex, TrustedPeer, PROTOCOL_VERSION};
use cribcall_identity::tls::{client_config, server_name, PinnedServerVerifier};
use cribcall_identity::DeviceIdentity;

use crate::messages::{PairingMessage, Transcript};
use crate::session::{comparison_code, derive_pairing_key};

const MAX_RESPONSE_BODY: usize = 64 * 1024;

type TlsClientStream = tokio_rustls::client::TlsStream<TcpStream>;

/// A successfully paired monitor, ready to insert into the listener's trust
/// store, plus the code both humans compare.
#[derive(Debug)]
pub struct PairingOutcome {
    pub monitor: TrustedPeer,
    pub comparison_code: String,
    pub session_id: String,
}

pub struct PairingClient {
    host: String,
    port: u16,
    identity: DeviceIdentity,
    listener_name: String,
}

impl PairingClient {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        identity: DeviceIdentity,
        listener_name: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            identity,
            listener_name: listener_name.into(),
        }
    }

    /// Connect, observe the monitor's TLS leaf, and send PIN_PAIRING_INIT.
    ///
    /// `monitor_id` and `monitor_name` come from discovery or the QR payload;
    /// the observed leaf fingerprint is what actually gets pinned.
    pub async fn begin(
        &self,
        monitor_id: &str,
        monitor_name: &str,
        pairing_token: Option<&str>,
    ) -> anyhow::Result<PairingHandshake> {
        let verifier = PinnedServerVerifier::observe_only();
        let config = client_config(Some(&self.identity), Arc::clone(&verifier))?;
        let connector = tokio_rustls::TlsConnector::from(config);

        let tcp = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .with_context(|| format!("TCP connect to {}:{}", self.host, self.port))?;
        tcp.set_nodelay(true)?;
        let tls = connector
            .connect(server_name(&self.host)?, tcp)
            .await
            .with_context(|| format!("TLS handshake with {}:{}", self.host, self.port))?;

        let monitor_leaf = verifier
            .observed_leaf()
            .context("no monitor certificate observed during handshake")?;
        let monitor_fingerprint = sha256_hex(&monitor_leaf);
        debug!(
            "[pairing] Observed monitor leaf {}",
            &monitor_fingerprint[..16]
        );

        let mut conn = HttpConnection::new(tls);
        let init = PairingMessage::PinPairingInit {
            listener_id: self.identity.device_id().to_owned(),
            listener_name: self.listener_name.clone(),
            protocol_version: PROTOCOL_VERSION,
            listener_cert_fingerprint: self.identity.cert_fingerprint().to_owned(),
            pairing_token: pairing_token.map(str::to_owned),
        };
        conn.write_request("POST", "/pair", &[], &serde_json::to_vec(&init)?)
            .await?;
        let resp = conn.read_response(MAX_RESPONSE_BODY).await?;
        anyhow::ensure!(resp.status == 200, "pairing init returned {}", resp.status);

        let (session_id, pake_msg_a) = match resp.json()? {
            PairingMessage::PinRequired {
                pairing_session_id,
                pake_msg_a,
                ..
            } => (pairing_session_id, pake_msg_a),
            PairingMessage::PairRejected { reason } => {
                anyhow::bail!("pairing refused: {}", reason.kind())
            }
            other => anyhow::bail!("unexpected pairing reply: {other:?}"),
        };

        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        let pake_msg_b = STANDARD.encode(PublicKey::from(&secret).as_bytes());

        info!("[pairing] Session {} awaiting PIN", session_id);
        Ok(PairingHandshake {
            conn,
            listener_id: self.identity.device_id().to_owned(),
            listener_cert_fingerprint: self.identity.cert_fingerprint().to_owned(),
            monitor_id: monitor_id.to_owned(),
            monitor_name: monitor_name.to_owned(),
            monitor_fingerprint,
            monitor_leaf,
            host: self.host.clone(),
            session_id,
            secret,
            pake_msg_a,
            pake_msg_b,
        })
    }
}

/// An in-flight pairing session, between PIN_REQUIRED and PIN_SUBMIT.
pub struct PairingHandshake {
    conn: HttpConnection<TlsClientStream>,
    listener_id: String,
    listener_cert_fingerprint: String,
    monitor_id: String,
    monitor_name: String,
    monitor_fingerprint: String,
    monitor_leaf: Vec<u8>,
    host: String,
    session_id: String,
    secret: StaticSecret,
    pake_msg_a: String,
    pake_msg_b: String,
}

impl std::fmt::Debug for PairingHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingHandshake")
            .field("listener_id", &self.listener_id)
            .field("listener_cert_fingerprint", &self.listener_cert_fingerprint)
            .field("monitor_id", &self.monitor_id)
            .field("monitor_name", &self.monitor_name)
            .field("monitor_fingerprint", &self.monitor_fingerprint)
            .field("host", &self.host)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl PairingHandshake {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The fingerprint of the leaf observed during the handshake.
    pub fn monitor_fingerprint(&self) -> &str {
        &self.monitor_fingerprint
    }

    /// The code this device should display next to the PIN prompt.
    pub fn comparison_code(&self) -> String {
        comparison_code(
            &self.monitor_id,
            &self.listener_id,
            &self.pake_msg_a,
            &self.pake_msg_b,
            &self.session_id,
        )
    }

    /// Derive the key from the typed PIN, send PIN_SUBMIT, and wait for the
    /// monitor user's decision.
    pub async fn submit_pin(mut self, pin: &str) -> anyhow::Result<PairingOutcome> {
        let monitor_public = decode_public_key(&self.pake_msg_a)
            .context("monitor sent a malformed pakeMsgA")?;
        let key = derive_pairing_key(&self.secret, &monitor_public, pin);

        let transcript = Transcript {
            monitor_id: self.monitor_id.clone(),
            listener_id: self.listener_id.clone(),
            listener_cert_fingerprint: self.listener_cert_fingerprint.clone(),
            monitor_cert_fingerprint: self.monitor_fingerprint.clone(),
            pairing_session_id: self.session_id.clone(),
        };
        let auth_tag = hmac_tag(&key, &transcript)?;
        let code = self.comparison_code();
        info!("[pairing] Comparison code: {}", code);

        let submit = PairingMessage::PinSubmit {
            pairing_session_id: self.session_id.clone(),
            pake_msg_b: self.pake_msg_b.clone(),
            transcript,
            auth_tag,
        };
        self.conn
            .write_request("POST", "/pair", &[], &serde_json::to_vec(&submit)?)
            .await?;
        // The monitor holds this response until its user confirms or the
        // session expires.
        let resp = self.conn.read_response(MAX_RESPONSE_BODY).await?;
        anyhow::ensure!(resp.status == 200, "pairing submit returned {}", resp.status);

        match resp.json()? {
            PairingMessage::PairAccepted {
                monitor_cert_fingerprint,
                ..
            } => {
                // Round-trip check: the fingerprint the monitor claims must be
                // the leaf we actually saw.
                anyhow::ensure!(
                    monitor_cert_fingerprint == self.monitor_fingerprint,
                    "monitor fingerprint mismatch: claimed {}, observed {}",
                    monitor_cert_fingerprint,
                    self.monitor_fingerprint
                );

                let mut monitor = TrustedPeer::new(
                    &self.monitor_id,
                    &self.monitor_name,
                    &self.monitor_fingerprint,
                    Some(&self.monitor_leaf),
                );
                monitor.last_known_ip = Some(self.host.clone());
                info!(
                    "[pairing] Paired with monitor '{}' ({})",
                    self.monitor_name,
                    &self.monitor_fingerprint[..16]
                );
                Ok(PairingOutcome {
                    monitor,
                    comparison_code: code,
                    session_id: self.session_id,
                })
            }
            PairingMessage::PairRejected { reason } => {
                anyhow::bail!("pairing rejected: {}", reason.kind())
            }
            other => anyhow::bail!("unexpected pairing reply: {other:?}"),
        }
    }
}

fn decode_public_key(b64: &str) -> Option<PublicKey> {
    let bytes = STANDARD.decode(b64).ok()?;
    let array: [u8; 32] = bytes.try_into().ok()?;
    Some(PublicKey::from(array))
}
