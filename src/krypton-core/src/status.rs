//! Control-plane status taxonomy.
//!
//! Every failure that flows through the session state machine is a
//! [`Status`]: a coarse code, a human-readable message, and a structured
//! detail. Permanence decisions are made from the code and the detail,
//! never from the message text.

use thiserror::Error;

/// Coarse error classification, mirroring the canonical RPC code space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    Cancelled,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    Aborted,
    PermissionDenied,
    Unauthenticated,
    ResourceExhausted,
    FailedPrecondition,
    Unimplemented,
    Internal,
    Unavailable,
    Unknown,
}

/// Structured detail attached to a status by the PPN backends or by the
/// platform layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetailedError {
    #[default]
    Unspecified,
    /// The platform revoked the VPN permission; the session cannot recover.
    VpnPermissionRevoked,
    /// The backend refused service for this country.
    DisallowedCountry,
}

/// A failure carried through the control plane.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{code:?}: {message}")]
pub struct Status {
    pub code: Code,
    pub message: String,
    pub detailed_error: DetailedError,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detailed_error: DetailedError::Unspecified,
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(Code::FailedPrecondition, message)
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(Code::Unauthenticated, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(Code::PermissionDenied, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(Code::DeadlineExceeded, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(Code::ResourceExhausted, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(Code::Unknown, message)
    }

    pub fn with_detail(mut self, detail: DetailedError) -> Self {
        self.detailed_error = detail;
        self
    }

    /// Maps an HTTP response status to a [`Status`].
    ///
    /// The zinc and brass backends reserve 412 for disallowed countries and
    /// do not attach structured details, so the detail is synthesized here.
    pub fn from_http(http_status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match http_status {
            400 => Self::new(Code::InvalidArgument, message),
            401 => Self::new(Code::Unauthenticated, message),
            403 => Self::new(Code::PermissionDenied, message),
            404 => Self::new(Code::NotFound, message),
            408 | 504 => Self::new(Code::DeadlineExceeded, message),
            409 => Self::new(Code::Aborted, message),
            412 => Self::new(Code::FailedPrecondition, message)
                .with_detail(DetailedError::DisallowedCountry),
            429 => Self::new(Code::ResourceExhausted, message),
            499 => Self::new(Code::Cancelled, message),
            500 => Self::new(Code::Internal, message),
            501 => Self::new(Code::Unimplemented, message),
            503 => Self::new(Code::Unavailable, message),
            other if (400..500).contains(&other) => Self::new(Code::FailedPrecondition, message),
            other if (500..600).contains(&other) => Self::new(Code::Internal, message),
            _ => Self::new(Code::Unknown, message),
        }
    }

    /// Whether this failure terminates the session. Permanence comes from
    /// the structured detail, never from the bare HTTP-derived code: an
    /// auth 401/403 stays a control-plane disconnect.
    pub fn is_permanent(&self) -> bool {
        match self.detailed_error {
            DetailedError::VpnPermissionRevoked => true,
            DetailedError::DisallowedCountry => self.code == Code::FailedPrecondition,
            DetailedError::Unspecified => false,
        }
    }
}

impl From<serde_json::Error> for Status {
    fn from(e: serde_json::Error) -> Self {
        Status::invalid_argument(format!("malformed JSON body: {e}"))
    }
}

impl From<krypton_crypto::CryptoError> for Status {
    fn from(e: krypton_crypto::CryptoError) -> Self {
        Status::internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_mapping() {
        assert_eq!(Status::from_http(400, "x").code, Code::InvalidArgument);
        assert_eq!(Status::from_http(401, "x").code, Code::Unauthenticated);
        assert_eq!(Status::from_http(403, "x").code, Code::PermissionDenied);
        assert_eq!(Status::from_http(429, "x").code, Code::ResourceExhausted);
        assert_eq!(Status::from_http(500, "x").code, Code::Internal);
        assert_eq!(Status::from_http(503, "x").code, Code::Unavailable);
        assert_eq!(Status::from_http(504, "x").code, Code::DeadlineExceeded);
        assert_eq!(Status::from_http(418, "x").code, Code::FailedPrecondition);
        assert_eq!(Status::from_http(599, "x").code, Code::Internal);
        assert_eq!(Status::from_http(700, "x").code, Code::Unknown);
    }

    #[test]
    fn test_disallowed_country_is_permanent() {
        let status = Status::from_http(412, "blocked");
        assert_eq!(status.detailed_error, DetailedError::DisallowedCountry);
        assert!(status.is_permanent());
    }

    #[test]
    fn test_vpn_permission_revoked_is_permanent() {
        let status = Status::failed_precondition("tunnel")
            .with_detail(DetailedError::VpnPermissionRevoked);
        assert!(status.is_permanent());
    }

    #[test]
    fn test_transient_is_not_permanent() {
        assert!(!Status::unavailable("dns").is_permanent());
        assert!(!Status::internal("500").is_permanent());
        assert!(!Status::failed_precondition("plain").is_permanent());
        assert!(!Status::unauthenticated("401").is_permanent());
    }

    #[test]
    fn test_auth_denials_are_not_permanent() {
        // 401/403 from zinc or initial-data stay control-plane disconnects.
        assert!(!Status::from_http(401, "unauthenticated").is_permanent());
        assert!(!Status::from_http(403, "forbidden").is_permanent());
        assert!(!Status::permission_denied("bare").is_permanent());
    }

    #[test]
    fn test_display_includes_code_and_message() {
        let status = Status::internal("boom");
        let text = status.to_string();
        assert!(text.contains("Internal"));
        assert!(text.contains("boom"));
    }
}
