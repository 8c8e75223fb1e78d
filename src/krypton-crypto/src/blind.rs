//! Blind-token client material for the authentication exchange.
//!
//! The authentication service signs tokens it cannot read: the client blinds
//! a fresh random message, sends the blinded form, and unblinds the returned
//! signature. The RSA blind-signature scheme itself is consumed from the
//! `blind-rsa-signatures` crate; this module holds the per-round state
//! (message, blinding secret, randomizer) and the metadata binding.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use blind_rsa_signatures::{
    BlindSignature, BlindingResult, Options, PublicKey as BlindingPublicKey,
};

use crate::error::{CryptoError, Result};
use crate::rng;

/// A signed token ready for the egress request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnblindedToken {
    /// The plaintext message that was blindly signed, with the metadata
    /// binding appended.
    pub plaintext_message: String,
    /// The unblinded signature over `signed_message()`.
    pub token: Vec<u8>,
    /// The message randomizer applied before signing.
    pub message_mask: Vec<u8>,
}

/// Blind-token state for one authentication round.
///
/// One instance per `Auth::start`; the blinding secret never survives the
/// round it was created for.
pub struct AuthCrypto {
    original_message: String,
    metadata: Option<[u8; 8]>,
    blinding_key: Option<BlindingPublicKey>,
    blinding: Option<BlindingResult>,
    options: Options,
}

impl AuthCrypto {
    pub fn new() -> Self {
        let token: [u8; 32] = rng::random_bytes();
        Self {
            original_message: format!("blind:{}", URL_SAFE_NO_PAD.encode(token)),
            metadata: None,
            blinding_key: None,
            blinding: None,
            options: Options::default(),
        }
    }

    /// The random plaintext message for this round.
    pub fn original_message(&self) -> &str {
        &self.original_message
    }

    /// Installs the signer's public key, PEM-encoded.
    pub fn set_blinding_public_key(&mut self, pem: &str) -> Result<()> {
        let key = BlindingPublicKey::from_pem(pem)
            .map_err(|e| CryptoError::InvalidKey(format!("bad blinding public key: {e}")))?;
        self.blinding_key = Some(key);
        Ok(())
    }

    /// The message actually signed: the plaintext token with the
    /// public-metadata fingerprint appended when metadata is in use.
    fn signed_message(&self) -> Vec<u8> {
        let mut msg = self.original_message.as_bytes().to_vec();
        if let Some(metadata) = &self.metadata {
            msg.extend_from_slice(metadata);
        }
        msg
    }

    /// Blinds the token, binding it to the given public-metadata
    /// fingerprint. Returns the blinded message for the wire.
    pub fn blind_token(&mut self, metadata_fingerprint: Option<[u8; 8]>) -> Result<Vec<u8>> {
        let key = self
            .blinding_key
            .as_ref()
            .ok_or_else(|| CryptoError::Precondition("no blinding public key set".into()))?;
        self.metadata = metadata_fingerprint;
        let msg = self.signed_message();
        let result = key.blind(&mut rng::secure_rng(), msg, true, &self.options)?;
        let blinded = result.blind_msg.0.clone();
        self.blinding = Some(result);
        Ok(blinded)
    }

    /// Unblinds and verifies the signer's response.
    pub fn finalize_token(&self, blind_signature: &[u8]) -> Result<UnblindedToken> {
        let key = self
            .blinding_key
            .as_ref()
            .ok_or_else(|| CryptoError::Precondition("no blinding public key set".into()))?;
        let blinding = self
            .blinding
            .as_ref()
            .ok_or_else(|| CryptoError::Precondition("no blinded token outstanding".into()))?;
        let msg = self.signed_message();
        let signature = key.finalize(
            &BlindSignature(blind_signature.to_vec()),
            &blinding.secret,
            blinding.msg_randomizer,
            &msg,
            &self.options,
        )?;
        let message_mask = blinding
            .msg_randomizer
            .map(|r| r.0.to_vec())
            .unwrap_or_default();
        Ok(UnblindedToken {
            plaintext_message: String::from_utf8_lossy(&msg).into_owned(),
            token: signature.0.clone(),
            message_mask,
        })
    }
}

impl Default for AuthCrypto {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blind_rsa_signatures::KeyPair;

    #[test]
    fn test_original_message_prefix_and_uniqueness() {
        let a = AuthCrypto::new();
        let b = AuthCrypto::new();
        assert!(a.original_message().starts_with("blind:"));
        assert_ne!(a.original_message(), b.original_message());
    }

    #[test]
    fn test_blind_requires_public_key() {
        let mut crypto = AuthCrypto::new();
        assert!(matches!(
            crypto.blind_token(None),
            Err(CryptoError::Precondition(_))
        ));
    }

    #[test]
    fn test_blind_sign_roundtrip() {
        let mut rng = rng::secure_rng();
        let options = Options::default();
        let keypair = KeyPair::generate(&mut rng, 2048).unwrap();

        let mut crypto = AuthCrypto::new();
        crypto
            .set_blinding_public_key(&keypair.pk.to_pem().unwrap())
            .unwrap();

        let fingerprint = Some([1, 2, 3, 4, 5, 6, 7, 8]);
        let blinded = crypto.blind_token(fingerprint).unwrap();

        // The signer only ever sees the blinded message.
        let blind_sig = keypair
            .sk
            .blind_sign(&mut rng, &blinded, &options)
            .unwrap();

        let token = crypto.finalize_token(&blind_sig).unwrap();
        assert!(token.plaintext_message.starts_with("blind:"));
        assert!(!token.token.is_empty());
        assert_eq!(token.message_mask.len(), 32);
    }

    #[test]
    fn test_finalize_rejects_garbage_signature() {
        let mut rng = rng::secure_rng();
        let keypair = KeyPair::generate(&mut rng, 2048).unwrap();

        let mut crypto = AuthCrypto::new();
        crypto
            .set_blinding_public_key(&keypair.pk.to_pem().unwrap())
            .unwrap();
        crypto.blind_token(None).unwrap();

        let garbage = vec![0u8; 256];
        assert!(crypto.finalize_token(&garbage).is_err());
    }

    #[test]
    fn test_rejects_bad_pem() {
        let mut crypto = AuthCrypto::new();
        assert!(crypto.set_blinding_public_key("not a pem").is_err());
    }
}
