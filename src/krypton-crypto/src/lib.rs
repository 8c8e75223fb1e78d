//! # Krypton Crypto
//!
//! Client-side key material for the Krypton PPN session:
//!
//! - [`SessionCrypto`]: per-provisioning X25519 keypair, nonce and rekey
//!   signing key. Derives the IPsec/Bridge transform parameters handed to
//!   the datapath once the egress has answered with its own public value.
//! - [`AuthCrypto`]: the blind-token half of the authentication exchange.
//!   RSA blind signatures are consumed as a library; this module only
//!   prepares the blinded message and finalizes the returned signature.
//!
//! Neither type performs I/O. Everything here is synchronous and cheap
//! enough to run on a component looper.

pub mod blind;
pub mod error;
pub mod rng;
pub mod session;

pub use blind::{AuthCrypto, UnblindedToken};
pub use error::{CryptoError, Result};
pub use session::{
    BridgeTransformParams, CipherSuite, IpSecTransformParams, SessionCrypto, TransformParams,
};
