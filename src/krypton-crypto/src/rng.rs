//! Centralized randomness source.
//!
//! All key material in this crate is drawn from the operating system RNG.
//! Routing it through one helper keeps the choice auditable.

use rand::rngs::OsRng;
use rand::RngCore;

/// Returns the RNG used for all key generation.
pub fn secure_rng() -> OsRng {
    OsRng
}

/// Fills a fixed-size array with random bytes.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Returns a random non-zero u32, used for SPI allocation.
pub fn random_nonzero_u32() -> u32 {
    loop {
        let v = OsRng.next_u32();
        if v != 0 {
            return v;
        }
    }
}
