//! Error types for cryptographic operations.

use thiserror::Error;

/// Error type for all cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Key generation failed (e.g., insufficient entropy)
    #[error("key generation failed: {0}")]
    KeyGen(String),

    /// Invalid key material (wrong size, bad format, verification failed)
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// Signing or signature verification failed
    #[error("signature error: {0}")]
    Signature(String),

    /// Blind-signature operation failed (blinding, unblinding, verification)
    #[error("blind signature error: {0}")]
    Blinding(String),

    /// Key derivation failed
    #[error("key derivation error: {0}")]
    Derivation(String),

    /// A precondition was not met (missing remote material, no blinding state)
    #[error("precondition failed: {0}")]
    Precondition(String),
}

/// Result type alias for cryptographic operations.
pub type Result<T> = std::result::Result<T, CryptoError>;

impl From<blind_rsa_signatures::Error> for CryptoError {
    fn from(e: blind_rsa_signatures::Error) -> Self {
        CryptoError::Blinding(e.to_string())
    }
}

impl From<base64::DecodeError> for CryptoError {
    fn from(e: base64::DecodeError) -> Self {
        CryptoError::InvalidKey(e.to_string())
    }
}
