use serde::{Deserialize, Serialize};

// MARK: - Protocol constants

pub const DEFAULT_CONTROL_PORT: u16 = 48080;
pub const DEFAULT_PAIRING_PORT: u16 = 48081;
pub const PROTOCOL_VERSION: u32 = 1;
pub const TRANSPORT: &str = "http-ws";

/// Current epoch milliseconds.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Current epoch seconds.
pub fn epoch_sec() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Lowercase hex SHA-256 of arbitrary bytes (64 chars).
///
/// This is the fingerprint form used everywhere a certificate or token is
/// identified.
pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(data))
}

// MARK: - DeviceRole

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    Monitor,
    Listener,
}

impl DeviceRole {
    /// Trust-store file name for this role (each role trusts the other).
    pub fn trust_file(&self) -> &'static str {
        match self {
            Self::Monitor => "trusted_listeners.json",
            Self::Listener => "trusted_monitors.json",
        }
    }
}

impl std::fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Monitor => write!(f, "monitor"),
            Self::Listener => write!(f, "listener"),
        }
    }
}

// MARK: - TrustedPeer

/// A remote device admitted by a completed pairing.
///
/// On the monitor these are listeners; on a listener these are monitors.
/// Identity is `cert_fingerprint`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustedPeer {
    pub remote_device_id: String,
    pub name: String,
    /// Lowercase hex SHA-256 of the peer's certificate DER.
    pub cert_fingerprint: String,
    pub added_at_epoch_sec: u64,
    /// Base64 DER of the peer leaf certificate. Required for the peer to pass
    /// the mTLS handshake; absent only for records imported without one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_der: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_known_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_noise_epoch_ms: Option<u64>,
}

impl TrustedPeer {
    pub fn new(
        remote_device_id: impl Into<String>,
        name: impl Into<String>,
        cert_fingerprint: impl Into<String>,
        certificate_der: Option<&[u8]>,
    ) -> Self {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        Self {
            remote_device_id: remote_device_id.into(),
            name: name.into(),
            cert_fingerprint: cert_fingerprint.into(),
            added_at_epoch_sec: epoch_sec(),
            certificate_der: certificate_der.map(|d| STANDARD.encode(d)),
            last_known_ip: None,
            last_noise_epoch_ms: None,
        }
    }

    /// Decoded certificate DER, if the record carries one.
    pub fn certificate_der_bytes(&self) -> Option<Vec<u8>> {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        self.certificate_der
            .as_ref()
            .and_then(|b64| STANDARD.decode(b64).ok())
    }
}

// MARK: - PushPlatform

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushPlatform {
    Android,
    Ios,
    Web,
}

impl PushPlatform {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "android" => Some(Self::Android),
            "ios" => Some(Self::Ios),
            "web" => Some(Self::Web),
            _ => None,
        }
    }
}

// MARK: - NoiseSubscription

/// A listener's push subscription, stored on the monitor.
///
/// At most one live subscription exists per (deviceId, fcmToken); the id is a
/// pure function of that pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoiseSubscription {
    pub device_id: String,
    pub cert_fingerprint: String,
    pub fcm_token: String,
    pub platform: PushPlatform,
    pub subscription_id: String,
    pub created_at_epoch_sec: u64,
    pub expires_at_epoch_sec: u64,
}

impl NoiseSubscription {
    /// `sha256_hex("<deviceId>|<fcmToken>")` — deterministic, replay-stable.
    pub fn subscription_id_for(device_id: &str, fcm_token: &str) -> String {
        sha256_hex(format!("{device_id}|{fcm_token}").as_bytes())
    }

    pub fn is_expired(&self, now_epoch_sec: u64) -> bool {
        now_epoch_sec >= self.expires_at_epoch_sec
    }
}

// MARK: - DetectedNoise

/// A noise event emitted by the sound detector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedNoise {
    pub timestamp_ms: u64,
    /// Peak loudness level over the qualifying window, 0..100.
    pub peak_level: f32,
}

// MARK: - QrPayload

/// Service block shared by the QR payload and mDNS advertisement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescriptor {
    pub protocol: String,
    pub version: u32,
    pub control_port: u16,
    pub pairing_port: u16,
    pub transport: String,
}

impl ServiceDescriptor {
    pub fn new(control_port: u16, pairing_port: u16) -> Self {
        Self {
            protocol: TRANSPORT.to_owned(),
            version: PROTOCOL_VERSION,
            control_port,
            pairing_port,
            transport: TRANSPORT.to_owned(),
        }
    }
}

/// Payload encoded (as canonical JSON) into the monitor's pairing QR code.
///
/// Consumers must tolerate unknown fields and verify
/// `monitor_cert_fingerprint` against the TLS leaf they observe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrPayload {
    pub monitor_id: String,
    pub monitor_name: String,
    pub monitor_cert_fingerprint: String,
    /// Base64 of the uncompressed P-256 public point (65 bytes, 0x04-led).
    pub monitor_public_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ips: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pairing_token: Option<String>,
    pub service: ServiceDescriptor,
}

// MARK: - MdnsAdvertisement

/// A resolved `_baby-monitor._tcp` service instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MdnsAdvertisement {
    pub remote_device_id: String,
    pub monitor_name: String,
    pub cert_fingerprint: String,
    pub control_port: u16,
    pub pairing_port: u16,
    pub version: u32,
    pub transport: String,
    pub ip: String,
}

impl MdnsAdvertisement {
    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.ip, self.control_port)
    }

    pub fn pairing_addr(&self) -> String {
        format!("{}:{}", self.ip, self.pairing_port)
    }
}
