//! Public metadata and its deterministic fingerprint.
//!
//! The metadata rides inside the blindly signed token to identify service
//! class and exit location without identifying the user. Its fingerprint
//! must be bit-exact across platforms: fields are concatenated in tag
//! order, numeric fields equal to their default are omitted so new fields
//! can be added without changing existing encodings.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Exit location requested for this session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExitLocation {
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub city_geo_id: String,
}

/// Proto-style timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Timestamp {
    #[serde(default)]
    pub seconds: i64,
    #[serde(default)]
    pub nanos: i32,
}

/// Debug-mode marker carried by the metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DebugMode {
    #[default]
    #[serde(rename = "UNSPECIFIED_DEBUG_MODE")]
    Unspecified,
    #[serde(rename = "DEBUG_ALL")]
    DebugAll,
}

/// The public metadata record bound into each auth token.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PublicMetadata {
    #[serde(default)]
    pub exit_location: ExitLocation,
    #[serde(default)]
    pub service_type: String,
    #[serde(default)]
    pub expiration: Timestamp,
    #[serde(default)]
    pub debug_mode: DebugMode,
}

fn omit_default(value: i64) -> String {
    if value == 0 {
        String::new()
    } else {
        value.to_string()
    }
}

/// Deterministic 64-bit identifier for a metadata record.
///
/// SHA-256 over the concatenated field values in tag order; the first
/// 8 bytes of the digest, big-endian.
pub fn fingerprint(metadata: &PublicMetadata) -> u64 {
    let input = format!(
        "{}{}{}{}{}",
        metadata.exit_location.country,
        metadata.exit_location.city_geo_id,
        metadata.service_type,
        omit_default(metadata.expiration.seconds),
        omit_default(metadata.expiration.nanos as i64),
    );
    let digest = Sha256::digest(input.as_bytes());
    let mut first = [0u8; 8];
    first.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(first)
}

/// Sortable big-endian encoding of a u64. The byte form compares
/// identically to the integer form.
pub fn u64_to_be_bytes(value: u64) -> [u8; 8] {
    value.to_be_bytes()
}

/// Inverse of [`u64_to_be_bytes`].
pub fn be_bytes_to_u64(bytes: &[u8; 8]) -> u64 {
    u64::from_be_bytes(*bytes)
}
