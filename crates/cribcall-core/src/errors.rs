use thiserror::Error;

/// Control-plane error taxonomy.
///
/// `kind()` yields the stable wire identifier carried in HTTP error bodies
/// (`{"error": "<kind>"}`) and in PAIR_REJECTED reasons.
#[derive(Error, Debug)]
pub enum CribcallError {
    #[error("client certificate required")]
    ClientCertificateRequired,

    #[error("certificate not trusted")]
    CertificateNotTrusted,

    #[error("unauthenticated")]
    Unauthenticated,

    #[error("peer is not trusted")]
    Untrusted,

    #[error("missing or invalid fcmToken")]
    InvalidFcmToken,

    #[error("missing or invalid platform")]
    InvalidPlatform,

    #[error("deviceId is derived from the client certificate and must not be supplied")]
    DeviceIdForbidden,

    #[error("unknown fields: {}", .0.join(", "))]
    UnknownFields(Vec<String>),

    #[error("fcmToken or subscriptionId required")]
    MissingIdentifier,

    #[error("server fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },

    #[error("pairing session expired")]
    PairSessionExpired,

    #[error("pairing session locked after too many attempts")]
    PairSessionLocked,

    #[error("invalid PIN")]
    PairInvalidPin,

    #[error("pairing transcript does not match session context")]
    PairTranscriptMismatch,

    #[error("pairing rejected by user")]
    PairUserRejected,

    #[error("no such pairing session")]
    PairNoSession,

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("not found")]
    NotFound,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CribcallError {
    /// Stable wire identifier for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ClientCertificateRequired => "client_certificate_required",
            Self::CertificateNotTrusted => "certificate_not_trusted",
            Self::Unauthenticated => "unauthenticated",
            Self::Untrusted => "untrusted",
            Self::InvalidFcmToken => "invalid_fcm_token",
            Self::InvalidPlatform => "invalid_platform",
            Self::DeviceIdForbidden => "device_id_forbidden",
            Self::UnknownFields(_) => "unknown_fields",
            Self::MissingIdentifier => "missing_identifier",
            Self::FingerprintMismatch { .. } => "fingerprint_mismatch",
            Self::PairSessionExpired => "pair_session_expired",
            Self::PairSessionLocked => "pair_session_locked",
            Self::PairInvalidPin => "pair_invalid_pin",
            Self::PairTranscriptMismatch => "pair_transcript_mismatch",
            Self::PairUserRejected => "pair_user_rejected",
            Self::PairNoSession => "pair_no_session",
            Self::PayloadTooLarge => "payload_too_large",
            Self::NotFound => "not_found",
            Self::Internal(_) | Self::Io(_) | Self::Json(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(CribcallError::DeviceIdForbidden.kind(), "device_id_forbidden");
        assert_eq!(
            CribcallError::UnknownFields(vec!["x".into()]).kind(),
            "unknown_fields"
        );
        let io = CribcallError::Io(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert_eq!(io.kind(), "internal");
    }
}
