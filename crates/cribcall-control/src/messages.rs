//! Application message set carried over the control WebSocket.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Audio,
    Video,
}

/// Type-tagged JSON messages exchanged post-upgrade.
///
/// `NOISE_EVENT` flows monitor → listener; the stream/WebRTC family is
/// relayed verbatim between the peers negotiating media; PING/PONG is the
/// application-level heartbeat, independent of WebSocket control frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    #[serde(rename = "NOISE_EVENT", rename_all = "camelCase")]
    NoiseEvent { timestamp_ms: u64, peak_level: f32 },

    #[serde(rename = "START_STREAM_REQUEST", rename_all = "camelCase")]
    StartStreamRequest {
        session_id: String,
        stream_type: StreamType,
    },

    #[serde(rename = "START_STREAM_RESPONSE", rename_all = "camelCase")]
    StartStreamResponse {
        session_id: String,
        accepted: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    #[serde(rename = "WEBRTC_OFFER", rename_all = "camelCase")]
    WebrtcOffer { session_id: String, sdp: String },

    #[serde(rename = "WEBRTC_ANSWER", rename_all = "camelCase")]
    WebrtcAnswer { session_id: String, sdp: String },

    #[serde(rename = "WEBRTC_ICE", rename_all = "camelCase")]
    WebrtcIce { session_id: String, candidate: String },

    #[serde(rename = "END_STREAM", rename_all = "camelCase")]
    EndStream { session_id: String },

    #[serde(rename = "PIN_STREAM", rename_all = "camelCase")]
    PinStream { session_id: String },

    #[serde(rename = "PING", rename_all = "camelCase")]
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp_ms: Option<u64>,
    },

    #[serde(rename = "PONG", rename_all = "camelCase")]
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp_ms: Option<u64>,
    },
}

impl ControlMessage {
    pub fn noise(event: cribcall_core::DetectedNoise) -> Self {
        Self::NoiseEvent {
            timestamp_ms: event.timestamp_ms,
            peak_level: event.peak_level,
        }
    }

    pub fn is_noise_event(&self) -> bool {
        matches!(self, Self::NoiseEvent { .. })
    }

    /// The stream session this message belongs to, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::StartStreamRequest { session_id, .. }
            | Self::StartStreamResponse { session_id, .. }
            | Self::WebrtcOffer { session_id, .. }
            | Self::WebrtcAnswer { session_id, .. }
            | Self::WebrtcIce { session_id, .. }
            | Self::EndStream { session_id }
            | Self::PinStream { session_id } => Some(session_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noise_event_wire_shape() {
        let msg = ControlMessage::NoiseEvent {
            timestamp_ms: 1700000000000,
            peak_level: 62.5,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "NOISE_EVENT");
        assert_eq!(json["timestampMs"], 1700000000000u64);
        assert_eq!(json["peakLevel"], 62.5);
    }

    #[test]
    fn webrtc_messages_roundtrip() {
        let msg = ControlMessage::WebrtcOffer {
            session_id: "s1".into(),
            sdp: "v=0".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"WEBRTC_OFFER""#));
        assert!(json.contains(r#""sessionId":"s1""#));
        let back: ControlMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.session_id(), Some("s1"));
    }

    #[test]
    fn ping_omits_absent_timestamp() {
        let json = serde_json::to_string(&ControlMessage::Ping { timestamp_ms: None }).unwrap();
        assert_eq!(json, r#"{"type":"PING"}"#);
        let back: ControlMessage = serde_json::from_str(r#"{"type":"PING"}"#).unwrap();
        assert_eq!(back, ControlMessage::Ping { timestamp_ms: None });
    }

    #[test]
    fn stream_type_is_lowercase_on_the_wire() {
        let msg = ControlMessage::StartStreamRequest {
            session_id: "s".into(),
            stream_type: StreamType::Audio,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["streamType"], "audio");
    }
}
