//! Per-session key material.
//!
//! Every provisioning round creates a fresh [`SessionCrypto`]: an X25519
//! keypair whose public value is sent to the egress, a local nonce, and an
//! Ed25519 keypair used to authenticate later rekeys. Once the egress
//! responds with its own public value and nonce, the shared secret is run
//! through HKDF-SHA256 to produce the uplink/downlink transform parameters
//! consumed by the datapath.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::{Signer, SigningKey, Verifier};
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret as X25519Secret};
use zeroize::Zeroizing;

use crate::error::{CryptoError, Result};
use crate::rng;

const NONCE_LEN: usize = 16;
const HKDF_INFO: &[u8] = b"Krypton PPN";

// Key placements in the 72-byte HKDF output for IPsec.
const UPLINK_KEY_LEN: usize = 32;
const DOWNLINK_KEY_LEN: usize = 32;
const SALT_LEN: usize = 4;
const IPSEC_HKDF_LEN: usize = UPLINK_KEY_LEN + DOWNLINK_KEY_LEN + 2 * SALT_LEN;

/// AEAD suite requested from the egress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CipherSuite {
    #[default]
    Aes128Gcm,
    Aes256Gcm,
}

impl CipherSuite {
    pub fn key_len(self) -> usize {
        match self {
            CipherSuite::Aes128Gcm => 16,
            CipherSuite::Aes256Gcm => 32,
        }
    }
}

/// IPsec transform parameters handed to the datapath.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpSecTransformParams {
    pub uplink_key: Vec<u8>,
    pub downlink_key: Vec<u8>,
    pub uplink_salt: Vec<u8>,
    pub downlink_salt: Vec<u8>,
    pub downlink_spi: u32,
}

/// Bridge (userspace AEAD) transform parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeTransformParams {
    pub uplink_key: Vec<u8>,
    pub downlink_key: Vec<u8>,
    pub suite: CipherSuite,
}

/// Key material for one datapath incarnation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformParams {
    IpSec(IpSecTransformParams),
    Bridge(BridgeTransformParams),
}

/// Session key material for one provisioning round.
///
/// Created fresh on every `Provision::start` and on every rekey. The rekey
/// signing key outlives the X25519 keypair conceptually: the *previous*
/// round's signing key signs the *new* round's public value, which is how
/// the egress ties a rekey to the running session.
pub struct SessionCrypto {
    secret: X25519Secret,
    public: X25519Public,
    local_nonce: [u8; NONCE_LEN],
    signing_key: SigningKey,
    downlink_spi: u32,
    remote_public: Option<[u8; 32]>,
    remote_nonce: Option<[u8; NONCE_LEN]>,
    rekey_signature: Option<Vec<u8>>,
}

impl SessionCrypto {
    pub fn new() -> Self {
        let secret = X25519Secret::random_from_rng(rng::secure_rng());
        let public = X25519Public::from(&secret);
        Self {
            secret,
            public,
            local_nonce: rng::random_bytes(),
            signing_key: SigningKey::generate(&mut rng::secure_rng()),
            downlink_spi: rng::random_nonzero_u32(),
            remote_public: None,
            remote_nonce: None,
            rekey_signature: None,
        }
    }

    /// Base64 form of the client public value, as sent on the wire.
    pub fn public_value(&self) -> String {
        BASE64.encode(self.public.as_bytes())
    }

    /// Base64 form of the client nonce, as sent on the wire.
    pub fn nonce(&self) -> String {
        BASE64.encode(self.local_nonce)
    }

    pub fn public_value_bytes(&self) -> &[u8; 32] {
        self.public.as_bytes()
    }

    pub fn downlink_spi(&self) -> u32 {
        self.downlink_spi
    }

    /// Installs the egress's public value and nonce (both base64).
    pub fn set_remote_key_material(
        &mut self,
        public_value: &str,
        nonce: &str,
    ) -> Result<()> {
        let public = BASE64.decode(public_value)?;
        let public: [u8; 32] = public
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("remote public value must be 32 bytes".into()))?;
        let nonce = BASE64.decode(nonce)?;
        let nonce: [u8; NONCE_LEN] = nonce
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("remote nonce must be 16 bytes".into()))?;
        self.remote_public = Some(public);
        self.remote_nonce = Some(nonce);
        Ok(())
    }

    /// Signs `data` with the rekey verification key.
    pub fn generate_signature(&self, data: &[u8]) -> Vec<u8> {
        self.signing_key.sign(data).to_vec()
    }

    /// Public half of the rekey signing key, for the add-egress request.
    pub fn rekey_verification_key(&self) -> Vec<u8> {
        self.signing_key.verifying_key().to_bytes().to_vec()
    }

    /// Verifies a signature made by the key behind `verification_key`.
    pub fn verify_signature(verification_key: &[u8], data: &[u8], signature: &[u8]) -> Result<()> {
        let key: [u8; 32] = verification_key
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("verification key must be 32 bytes".into()))?;
        let key = ed25519_dalek::VerifyingKey::from_bytes(&key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let signature = ed25519_dalek::Signature::from_slice(signature)
            .map_err(|e| CryptoError::Signature(e.to_string()))?;
        key.verify(data, &signature)
            .map_err(|e| CryptoError::Signature(e.to_string()))
    }

    /// Records the signature the previous round made over this round's
    /// public value.
    pub fn set_signature(&mut self, signature: Vec<u8>) {
        self.rekey_signature = Some(signature);
    }

    pub fn rekey_signature(&self) -> Option<&[u8]> {
        self.rekey_signature.as_deref()
    }

    fn shared_secret(&self) -> Result<Zeroizing<[u8; 32]>> {
        let remote = self
            .remote_public
            .ok_or_else(|| CryptoError::Precondition("no remote public value set".into()))?;
        let shared = self.secret.diffie_hellman(&X25519Public::from(remote));
        Ok(Zeroizing::new(shared.to_bytes()))
    }

    fn hkdf_expand(&self, length: usize) -> Result<Zeroizing<Vec<u8>>> {
        let remote_nonce = self
            .remote_nonce
            .ok_or_else(|| CryptoError::Precondition("no remote nonce set".into()))?;
        let shared = self.shared_secret()?;
        let mut salt = Vec::with_capacity(2 * NONCE_LEN);
        salt.extend_from_slice(&self.local_nonce);
        salt.extend_from_slice(&remote_nonce);

        let hk = Hkdf::<Sha256>::new(Some(&salt), shared.as_slice());
        let mut okm = Zeroizing::new(vec![0u8; length]);
        hk.expand(HKDF_INFO, okm.as_mut_slice())
            .map_err(|e| CryptoError::Derivation(e.to_string()))?;
        Ok(okm)
    }

    /// Derives IPsec uplink/downlink keys and salts from the shared secret.
    pub fn ipsec_transform_params(&self) -> Result<TransformParams> {
        let okm = self.hkdf_expand(IPSEC_HKDF_LEN)?;
        let (uplink_key, rest) = okm.split_at(UPLINK_KEY_LEN);
        let (downlink_key, rest) = rest.split_at(DOWNLINK_KEY_LEN);
        let (uplink_salt, downlink_salt) = rest.split_at(SALT_LEN);
        Ok(TransformParams::IpSec(IpSecTransformParams {
            uplink_key: uplink_key.to_vec(),
            downlink_key: downlink_key.to_vec(),
            uplink_salt: uplink_salt.to_vec(),
            downlink_salt: downlink_salt.to_vec(),
            downlink_spi: self.downlink_spi,
        }))
    }

    /// Derives Bridge AEAD keys from the shared secret.
    pub fn bridge_transform_params(&self, suite: CipherSuite) -> Result<TransformParams> {
        let key_len = suite.key_len();
        let okm = self.hkdf_expand(2 * key_len)?;
        let (uplink_key, downlink_key) = okm.split_at(key_len);
        Ok(TransformParams::Bridge(BridgeTransformParams {
            uplink_key: uplink_key.to_vec(),
            downlink_key: downlink_key.to_vec(),
            suite,
        }))
    }
}

impl Default for SessionCrypto {
    fn default() -> Self {
        Self::new()
    }
}
