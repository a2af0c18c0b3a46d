//! Monitor-side PAKE session machine.
//!
//! Sessions live in memory only: a crash mid-pairing discards them and the
//! listener starts over. State machine per session:
//!
//! ```text
//! AwaitingPinRequired ──PIN_SUBMIT ok──► AwaitingConfirm ──user──► Confirmed
//!        │                                      │                  Rejected
//!        └──────────────60 s timer─────────────►└────────────────► Expired
//! ```
//!
//! Terminal states are final; a replayed PIN_SUBMIT against one answers
//! NO_SESSION.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use x25519_dalek::{PublicKey, StaticSecret};

use cribcall_core::canonical::{canonical_json, hmac_verify};

use crate::messages::{PairingMessage, RejectReason, Transcript};

pub const SESSION_TTL: Duration = Duration::from_secs(60);
pub const MAX_ATTEMPTS: u32 = 3;

// ── Key schedule ──────────────────────────────────────────────────────────────

/// Random 6-digit PIN, zero-padded.
pub fn generate_pin() -> String {
    format!("{:06}", rand::thread_rng().gen_range(0..1_000_000))
}

/// `HKDF-SHA-256(ikm = X25519(secret, peer), info = "cribcall-pake-<PIN>")`.
///
/// The PIN enters through the info string, so a wrong PIN yields a different
/// key and a failing transcript tag rather than an explicit comparison.
pub fn derive_pairing_key(secret: &StaticSecret, peer: &PublicKey, pin: &str) -> [u8; 32] {
    let shared = secret.diffie_hellman(peer);
    let hk = hkdf::Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut okm = [0u8; 32];
    hk.expand(format!("cribcall-pake-{pin}").as_bytes(), &mut okm)
        .expect("32 bytes is a valid HKDF-SHA-256 output length");
    okm
}

/// First 20 bits of the transcript hash mod 10^6, zero-padded to 6 digits.
/// Shown on both devices so the humans can spot a machine in the middle.
pub fn comparison_code(
    monitor_id: &str,
    listener_id: &str,
    pake_msg_a: &str,
    pake_msg_b: &str,
    pairing_session_id: &str,
) -> String {
    let canon = canonical_json(&serde_json::json!({
        "monitorId": monitor_id,
        "listenerId": listener_id,
        "pakeMsgA": pake_msg_a,
        "pakeMsgB": pake_msg_b,
        "pairingSessionId": pairing_session_id,
    }))
    .expect("comparison payload contains only strings");

    let digest = Sha256::digest(canon.as_bytes());
    let first20 =
        ((digest[0] as u32) << 12) | ((digest[1] as u32) << 4) | ((digest[2] as u32) >> 4);
    format!("{:06}", first20 % 1_000_000)
}

// ── Session state ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    AwaitingPinRequired,
    AwaitingConfirm,
    Confirmed,
    Rejected,
    Expired,
}

impl SessionState {
    fn is_terminal(self) -> bool {
        matches!(self, Self::Confirmed | Self::Rejected | Self::Expired)
    }
}

struct Session {
    listener_id: String,
    listener_name: String,
    listener_cert_fingerprint: String,
    pin: String,
    secret: StaticSecret,
    pake_msg_a: String,
    expires_at: Instant,
    attempts_used: u32,
    state: SessionState,
}

/// UI-facing prompts emitted while a pairing runs.
#[derive(Debug)]
pub enum PairingPrompt {
    /// Show this PIN to the user; the listener must type it.
    DisplayPin { session_id: String, pin: String },
    /// Both devices now show `comparison_code`; the user confirms or rejects.
    Confirm {
        session_id: String,
        listener_name: String,
        comparison_code: String,
        reply: oneshot::Sender<bool>,
    },
}

/// A listener the user accepted; the caller pins its certificate.
#[derive(Debug, Clone)]
pub struct AcceptedListener {
    pub device_id: String,
    pub name: String,
    pub cert_fingerprint: String,
}

// ── Engine ────────────────────────────────────────────────────────────────────

pub struct PairingEngine {
    monitor_id: String,
    monitor_cert_fingerprint: String,
    sessions: Mutex<HashMap<String, Session>>,
    tokens: Mutex<HashSet<String>>,
    prompt_tx: mpsc::Sender<PairingPrompt>,
}

impl PairingEngine {
    pub fn new(
        monitor_id: impl Into<String>,
        monitor_cert_fingerprint: impl Into<String>,
    ) -> (Arc<Self>, mpsc::Receiver<PairingPrompt>) {
        let (prompt_tx, prompt_rx) = mpsc::channel(16);
        (
            Arc::new(Self {
                monitor_id: monitor_id.into(),
                monitor_cert_fingerprint: monitor_cert_fingerprint.into(),
                sessions: Mutex::new(HashMap::new()),
                tokens: Mutex::new(HashSet::new()),
                prompt_tx,
            }),
            prompt_rx,
        )
    }

    pub fn monitor_id(&self) -> &str {
        &self.monitor_id
    }

    pub fn monitor_cert_fingerprint(&self) -> &str {
        &self.monitor_cert_fingerprint
    }

    /// Mint a one-time pairing token for the QR payload.
    pub fn issue_token(&self) -> String {
        let token: [u8; 16] = rand::thread_rng().gen();
        let token = hex::encode(token);
        self.tokens
            .lock()
            .expect("token set lock poisoned")
            .insert(token.clone());
        token
    }

    /// PIN_PAIRING_INIT → PIN_REQUIRED (or PAIR_REJECTED).
    pub fn handle_init(
        &self,
        listener_id: &str,
        listener_name: &str,
        listener_cert_fingerprint: &str,
        pairing_token: Option<&str>,
    ) -> PairingMessage {
        // A supplied token must be one we issued, and burns on first use.
        if let Some(token) = pairing_token {
            let consumed = self
                .tokens
                .lock()
                .expect("token set lock poisoned")
                .remove(token);
            if !consumed {
                warn!("[pairing] Rejected init with unknown or reused token");
                return PairingMessage::PairRejected {
                    reason: RejectReason::NoSession,
                };
            }
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let pin = generate_pin();
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        let pake_msg_a = STANDARD.encode(PublicKey::from(&secret).as_bytes());

        let mut sessions = self.sessions.lock().expect("session map lock poisoned");
        // Opportunistic sweep: expired sessions become sinks.
        let now = Instant::now();
        for session in sessions.values_mut() {
            if !session.state.is_terminal() && now >= session.expires_at {
                session.state = SessionState::Expired;
            }
        }
        sessions.insert(
            session_id.clone(),
            Session {
                listener_id: listener_id.to_owned(),
                listener_name: listener_name.to_owned(),
                listener_cert_fingerprint: listener_cert_fingerprint.to_owned(),
                pin: pin.clone(),
                secret,
                pake_msg_a: pake_msg_a.clone(),
                expires_at: now + SESSION_TTL,
                attempts_used: 0,
                state: SessionState::AwaitingPinRequired,
            },
        );
        drop(sessions);

        info!(
            "[pairing] Session {} started for '{}'",
            session_id, listener_name
        );
        if self
            .prompt_tx
            .try_send(PairingPrompt::DisplayPin {
                session_id: session_id.clone(),
                pin,
            })
            .is_err()
        {
            warn!("[pairing] Prompt channel full; PIN not displayed");
        }

        PairingMessage::PinRequired {
            pairing_session_id: session_id,
            pake_msg_a,
            expires_in_sec: SESSION_TTL.as_secs(),
            max_attempts: MAX_ATTEMPTS,
        }
    }

    /// PIN_SUBMIT → PAIR_ACCEPTED / PAIR_REJECTED, blocking on the user's
    /// confirmation when the tag verifies.
    pub async fn handle_submit(
        &self,
        session_id: &str,
        pake_msg_b: &str,
        transcript: &Transcript,
        auth_tag: &str,
    ) -> (PairingMessage, Option<AcceptedListener>) {
        let (confirm_rx, remaining, accepted) = {
            let mut sessions = self.sessions.lock().expect("session map lock poisoned");
            let Some(session) = sessions.get_mut(session_id) else {
                return (reject(RejectReason::NoSession), None);
            };
            if session.state.is_terminal() {
                return (reject(RejectReason::NoSession), None);
            }
            let now = Instant::now();
            if now >= session.expires_at {
                session.state = SessionState::Expired;
                return (reject(RejectReason::Expired), None);
            }
            if session.attempts_used >= MAX_ATTEMPTS {
                session.state = SessionState::Rejected;
                return (reject(RejectReason::Locked), None);
            }

            // Transcript must bind exactly this session's context.
            if transcript.monitor_id != self.monitor_id
                || transcript.monitor_cert_fingerprint != self.monitor_cert_fingerprint
                || transcript.listener_id != session.listener_id
                || transcript.listener_cert_fingerprint != session.listener_cert_fingerprint
                || transcript.pairing_session_id != session_id
            {
                return (reject(RejectReason::TranscriptMismatch), None);
            }

            let listener_public = match decode_public_key(pake_msg_b) {
                Some(key) => key,
                None => {
                    session.attempts_used += 1;
                    let reason = if session.attempts_used >= MAX_ATTEMPTS {
                        session.state = SessionState::Rejected;
                        RejectReason::Locked
                    } else {
                        RejectReason::InvalidPin
                    };
                    return (reject(reason), None);
                }
            };

            let key = derive_pairing_key(&session.secret, &listener_public, &session.pin);
            if !hmac_verify(&key, transcript, auth_tag) {
                session.attempts_used += 1;
                let reason = if session.attempts_used >= MAX_ATTEMPTS {
                    session.state = SessionState::Rejected;
                    RejectReason::Locked
                } else {
                    RejectReason::InvalidPin
                };
                return (reject(reason), None);
            }

            // Tag verified: surface the comparison code and wait for the user.
            let code = comparison_code(
                &self.monitor_id,
                &session.listener_id,
                &session.pake_msg_a,
                pake_msg_b,
                session_id,
            );
            session.state = SessionState::AwaitingConfirm;

            let (reply_tx, reply_rx) = oneshot::channel();
            if self
                .prompt_tx
                .try_send(PairingPrompt::Confirm {
                    session_id: session_id.to_owned(),
                    listener_name: session.listener_name.clone(),
                    comparison_code: code,
                    reply: reply_tx,
                })
                .is_err()
            {
                warn!("[pairing] Prompt channel full; rejecting session {}", session_id);
                session.state = SessionState::Rejected;
                return (reject(RejectReason::UserRejected), None);
            }

            let accepted = AcceptedListener {
                device_id: session.listener_id.clone(),
                name: session.listener_name.clone(),
                cert_fingerprint: session.listener_cert_fingerprint.clone(),
            };
            (reply_rx, session.expires_at - now, accepted)
        };

        match tokio::time::timeout(remaining, confirm_rx).await {
            Err(_) => {
                self.finalize(session_id, SessionState::Expired);
                (reject(RejectReason::Expired), None)
            }
            Ok(Err(_)) | Ok(Ok(false)) => {
                self.finalize(session_id, SessionState::Rejected);
                info!("[pairing] Session {} rejected by user", session_id);
                (reject(RejectReason::UserRejected), None)
            }
            Ok(Ok(true)) => {
                self.finalize(session_id, SessionState::Confirmed);
                info!(
                    "[pairing] Session {} confirmed; trusting '{}'",
                    session_id, accepted.name
                );
                (
                    PairingMessage::PairAccepted {
                        pairing_session_id: session_id.to_owned(),
                        monitor_cert_fingerprint: self.monitor_cert_fingerprint.clone(),
                    },
                    Some(accepted),
                )
            }
        }
    }

    fn finalize(&self, session_id: &str, state: SessionState) {
        let mut sessions = self.sessions.lock().expect("session map lock poisoned");
        if let Some(session) = sessions.get_mut(session_id) {
            session.state = state;
        }
    }

    #[cfg(test)]
    fn force_expire(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().expect("session map lock poisoned");
        if let Some(session) = sessions.get_mut(session_id) {
            session.expires_at = Instant::now() - Duration::from_secs(1);
        }
    }
}

fn reject(reason: RejectReason) -> PairingMessage {
    PairingMessage::PairRejected { reason }
}

fn decode_public_key(b64: &str) -> Option<PublicKey> {
    let bytes = STANDARD.decode(b64).ok()?;
    let array: [u8; 32] = bytes.try_into().ok()?;
    Some(PublicKey::from(array))
}
