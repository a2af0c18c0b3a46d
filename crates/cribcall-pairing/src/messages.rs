//! Pairing wire messages, carried over `POST /pair` or the pairing
//! WebSocket.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    Expired,
    Locked,
    InvalidPin,
    UserRejected,
    NoSession,
    TranscriptMismatch,
}

impl RejectReason {
    /// Matching error kind from the control-plane taxonomy.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Expired => "pair_session_expired",
            Self::Locked => "pair_session_locked",
            Self::InvalidPin => "pair_invalid_pin",
            Self::UserRejected => "pair_user_rejected",
            Self::NoSession => "pair_no_session",
            Self::TranscriptMismatch => "pair_transcript_mismatch",
        }
    }
}

/// Session-context binding both parties HMAC under the PAKE-derived key.
/// Hashed in canonical-JSON form, so field order never matters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transcript {
    pub monitor_id: String,
    pub listener_id: String,
    pub listener_cert_fingerprint: String,
    pub monitor_cert_fingerprint: String,
    pub pairing_session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PairingMessage {
    #[serde(rename = "PIN_PAIRING_INIT", rename_all = "camelCase")]
    PinPairingInit {
        listener_id: String,
        listener_name: String,
        protocol_version: u32,
        listener_cert_fingerprint: String,
        /// One-time token from the QR payload, when the token-gated variant
        /// is in use.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pairing_token: Option<String>,
    },

    #[serde(rename = "PIN_REQUIRED", rename_all = "camelCase")]
    PinRequired {
        pairing_session_id: String,
        /// Base64 of the monitor's ephemeral X25519 public key.
        pake_msg_a: String,
        expires_in_sec: u64,
        max_attempts: u32,
    },

    #[serde(rename = "PIN_SUBMIT", rename_all = "camelCase")]
    PinSubmit {
        pairing_session_id: String,
        /// Base64 of the listener's ephemeral X25519 public key.
        pake_msg_b: String,
        transcript: Transcript,
        /// Base64 HMAC-SHA-256 over the canonical transcript.
        auth_tag: String,
    },

    #[serde(rename = "PAIR_ACCEPTED", rename_all = "camelCase")]
    PairAccepted {
        pairing_session_id: String,
        monitor_cert_fingerprint: String,
    },

    #[serde(rename = "PAIR_REJECTED", rename_all = "camelCase")]
    PairRejected { reason: RejectReason },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_reasons_use_screaming_snake_case() {
        let json = serde_json::to_string(&PairingMessage::PairRejected {
            reason: RejectReason::TranscriptMismatch,
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"PAIR_REJECTED","reason":"TRANSCRIPT_MISMATCH"}"#);
    }

    #[test]
    fn init_roundtrips_without_token() {
        let json = r#"{
            "type": "PIN_PAIRING_INIT",
            "listenerId": "l1",
            "listenerName": "Phone",
            "protocolVersion": 1,
            "listenerCertFingerprint": "ab"
        }"#;
        let msg: PairingMessage = serde_json::from_str(json).unwrap();
        match msg {
            PairingMessage::PinPairingInit { pairing_token, listener_id, .. } => {
                assert_eq!(listener_id, "l1");
                assert!(pairing_token.is_none());
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
}
