//! Control-plane wire messages.
//!
//! JSON bodies for the four endpoints the client talks to: initial-data
//! (bootstrap metadata + signing key), zinc (auth-and-sign), brass
//! (add-egress) and update-path-info. Requests are built through
//! `serde_json::Value` so keys serialize in sorted order.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::{DatapathProtocol, IpGeoLevel, KryptonConfig};
use crate::network::IpRange;
use crate::public_metadata::{DebugMode, PublicMetadata, Timestamp};
use crate::status::Status;
use krypton_crypto::CipherSuite;

/// Expiry timestamps must land on these increments.
const EXPIRY_INCREMENT_SECS: i64 = 15 * 60;

// ---------------------------------------------------------------------------
// initial data

/// Request body for the initial-data endpoint.
#[derive(Debug, Clone)]
pub struct GetInitialDataRequest {
    pub use_attestation: bool,
    pub service_type: String,
    pub location_granularity: IpGeoLevel,
    pub validation_version: i64,
}

impl GetInitialDataRequest {
    pub fn to_json(&self) -> String {
        let granularity = match self.location_granularity {
            IpGeoLevel::Country => "COUNTRY",
            IpGeoLevel::City => "CITY_GEOS",
        };
        json!({
            "use_attestation": self.use_attestation,
            "service_type": self.service_type,
            "location_granularity": granularity,
            "validation_version": self.validation_version,
        })
        .to_string()
    }
}

/// The blind-signing public key advertised by the auth service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlindSigningPublicKey {
    /// PEM-encoded RSA public key.
    #[serde(default)]
    pub serialized_public_key: String,
    #[serde(default)]
    pub key_version: u64,
}

/// Public metadata plus its validation tag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublicMetadataInfo {
    #[serde(default)]
    pub public_metadata: PublicMetadata,
    #[serde(default)]
    pub validation_version: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttestationInfo {
    #[serde(default)]
    pub attestation_nonce: String,
}

/// Response body from the initial-data endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetInitialDataResponse {
    #[serde(default)]
    pub at_public_metadata_public_key: BlindSigningPublicKey,
    #[serde(default)]
    pub public_metadata_info: PublicMetadataInfo,
    #[serde(default)]
    pub attestation: AttestationInfo,
}

impl GetInitialDataResponse {
    pub fn from_json(body: &str) -> Result<Self, Status> {
        let response: Self = serde_json::from_str(body)?;
        if response.at_public_metadata_public_key.serialized_public_key.is_empty() {
            return Err(Status::invalid_argument(
                "initial data response missing signing public key",
            ));
        }
        Ok(response)
    }

    /// Validates the advertised metadata against the client configuration.
    pub fn verify_public_metadata(&self, config: &KryptonConfig) -> Result<(), Status> {
        let metadata = &self.public_metadata_info.public_metadata;
        if !timestamp_is_rounded(&metadata.expiration, EXPIRY_INCREMENT_SECS) {
            return Err(Status::internal(
                "public metadata expiry is not rounded to the expected increment",
            ));
        }
        if config.ip_geo_level != IpGeoLevel::City && !metadata.exit_location.city_geo_id.is_empty()
        {
            return Err(Status::internal(
                "received city_geo_id when request specified another geo level",
            ));
        }
        if metadata.service_type != config.service_type {
            return Err(Status::internal(
                "public metadata carries an unexpected service type",
            ));
        }
        if metadata.debug_mode != DebugMode::Unspecified && !config.debug_mode_allowed {
            return Err(Status::internal(
                "public metadata specifies a debug mode that is not allowed",
            ));
        }
        Ok(())
    }
}

fn timestamp_is_rounded(timestamp: &Timestamp, increment_secs: i64) -> bool {
    timestamp.nanos == 0 && timestamp.seconds % increment_secs == 0
}

// ---------------------------------------------------------------------------
// zinc (auth and sign)

/// Request body for the zinc endpoint.
#[derive(Debug, Clone, Default)]
pub struct AuthAndSignRequest {
    pub oauth_token: String,
    pub service_type: String,
    /// Base64 blinded tokens; empty when blind signing is disabled.
    pub blinded_tokens: Vec<String>,
    pub key_version: Option<u64>,
    pub public_metadata_info: Option<PublicMetadataInfo>,
}

impl AuthAndSignRequest {
    pub fn to_json(&self) -> String {
        let mut body = json!({
            "oauth_token": self.oauth_token,
            "service_type": self.service_type,
        });
        let object = body.as_object_mut().expect("body is an object");
        if !self.blinded_tokens.is_empty() {
            object.insert("blinded_token".into(), json!(self.blinded_tokens));
        }
        if let Some(key_version) = self.key_version {
            object.insert("key_type".into(), json!("AT_PUBLIC_METADATA_KEY_TYPE"));
            object.insert("key_version".into(), json!(key_version));
        }
        if let Some(info) = &self.public_metadata_info {
            object.insert(
                "public_metadata_info".into(),
                serde_json::to_value(info).expect("metadata serializes"),
            );
        }
        body.to_string()
    }
}

/// Response body from the zinc endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthAndSignResponse {
    #[serde(default)]
    pub blinded_token_signature: Vec<String>,
    #[serde(default)]
    pub copper_controller_hostname: String,
    #[serde(default)]
    pub region_token_and_signature: String,
    #[serde(default)]
    pub apn_type: String,
}

impl AuthAndSignResponse {
    /// Parses the body; when `enforce_copper_suffix` is set, a returned
    /// copper hostname must match one of the configured suffixes.
    pub fn from_json(
        body: &str,
        config: &KryptonConfig,
        enforce_copper_suffix: bool,
    ) -> Result<Self, Status> {
        let response: Self = serde_json::from_str(body)?;
        if enforce_copper_suffix
            && !response.copper_controller_hostname.is_empty()
            && !config.copper_hostname_suffix.is_empty()
            && !config
                .copper_hostname_suffix
                .iter()
                .any(|suffix| response.copper_controller_hostname.ends_with(suffix))
        {
            return Err(Status::invalid_argument(format!(
                "copper hostname {:?} does not match any allowed suffix",
                response.copper_controller_hostname
            )));
        }
        Ok(response)
    }
}

// ---------------------------------------------------------------------------
// brass (add egress)

/// Everything that goes into one add-egress request.
#[derive(Debug, Clone, Default)]
pub struct PpnDataplaneRequestParams {
    pub is_rekey: bool,
    pub control_plane_sockaddr: String,
    pub suite: CipherSuite,
    pub dataplane_protocol: DatapathProtocol,
    pub apn_type: String,
    pub region_token_and_signature: String,
    pub dynamic_mtu_enabled: bool,

    /// Base64 client public value.
    pub client_public_value: String,
    /// Base64 client nonce.
    pub client_nonce: String,
    pub downlink_spi: u32,

    /// Base64 rekey verification key; initial provisioning only.
    pub rekey_verification_key: Option<String>,
    /// Base64 signature by the previous key; rekey only.
    pub signature: Option<String>,
    pub previous_uplink_spi: Option<u32>,

    pub unblinded_token: Option<String>,
    /// Base64 unblinded token signature.
    pub unblinded_token_signature: Option<String>,
    /// Base64 message mask.
    pub message_mask: Option<String>,
    pub public_metadata: Option<PublicMetadata>,
    pub signing_key_version: Option<u64>,
}

/// Builds the brass request body.
pub struct AddEgressRequest;

impl AddEgressRequest {
    pub fn encode(params: &PpnDataplaneRequestParams) -> String {
        let suite = match params.suite {
            CipherSuite::Aes128Gcm => "AES128_GCM",
            CipherSuite::Aes256Gcm => "AES256_GCM",
        };
        let mut ppn = json!({
            "apn_type": params.apn_type,
            "client_nonce": params.client_nonce,
            "client_public_value": params.client_public_value,
            "control_plane_sock_addr": params.control_plane_sockaddr,
            "dataplane_protocol": params.dataplane_protocol.wire_name(),
            "downlink_spi": params.downlink_spi,
            "suite": suite,
        });
        let ppn_object = ppn.as_object_mut().expect("ppn is an object");
        if params.dynamic_mtu_enabled {
            ppn_object.insert("dynamic_mtu_enabled".into(), json!(true));
        }
        if let Some(key) = &params.rekey_verification_key {
            ppn_object.insert("rekey_verification_key".into(), json!(key));
        }
        if let Some(signature) = &params.signature {
            ppn_object.insert("rekey_signature".into(), json!(signature));
            if let Some(spi) = params.previous_uplink_spi {
                ppn_object.insert("previous_uplink_spi".into(), json!(spi));
            }
        }

        let mut body = json!({
            "ppn": ppn,
            "region_token_and_signature": params.region_token_and_signature,
        });
        let object = body.as_object_mut().expect("body is an object");
        if let Some(token) = &params.unblinded_token {
            object.insert("unblinded_token".into(), json!(token));
        }
        if let Some(signature) = &params.unblinded_token_signature {
            object.insert("unblinded_token_signature".into(), json!(signature));
        }
        if let Some(mask) = &params.message_mask {
            object.insert("message_mask".into(), json!(mask));
        }
        if let Some(metadata) = &params.public_metadata {
            object.insert(
                "public_metadata".into(),
                serde_json::to_value(metadata).expect("metadata serializes"),
            );
        }
        if let Some(version) = params.signing_key_version {
            object.insert("signing_key_version".into(), json!(version));
        }
        body.to_string()
    }
}

/// One user private IP entry; exactly one of the two forms is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrivateIp {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_range: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6_range: Option<String>,
}

impl PrivateIp {
    pub fn to_ip_range(&self) -> Result<IpRange, Status> {
        match (&self.ipv4_range, &self.ipv6_range) {
            (Some(range), _) => IpRange::parse(range),
            (None, Some(range)) => IpRange::parse(range),
            (None, None) => Err(Status::invalid_argument(
                "ip range is neither IPv4 nor IPv6",
            )),
        }
    }
}

/// The dataplane descriptor inside an add-egress response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PpnDataplaneResponse {
    #[serde(default)]
    pub user_private_ip: Vec<PrivateIp>,
    #[serde(default)]
    pub egress_point_sock_addr: Vec<String>,
    /// Base64 egress public value.
    #[serde(default)]
    pub egress_point_public_value: String,
    /// Base64 server nonce.
    #[serde(default)]
    pub server_nonce: String,
    #[serde(default)]
    pub uplink_spi: u32,
    #[serde(default)]
    pub expiry: String,
    #[serde(default)]
    pub control_plane_sock_addr: Option<String>,
}

/// Parsed add-egress response.
#[derive(Debug, Clone, Default)]
pub struct AddEgressResponse {
    pub ppn_dataplane: PpnDataplaneResponse,
}

#[derive(Debug, Clone, Deserialize)]
struct AddEgressBody {
    ppn_dataplane: Option<PpnDataplaneResponse>,
}

impl AddEgressResponse {
    pub fn from_json(body: &str) -> Result<Self, Status> {
        let body: AddEgressBody = serde_json::from_str(body)?;
        let ppn_dataplane = body
            .ppn_dataplane
            .ok_or_else(|| Status::invalid_argument("no dataplane response found"))?;
        if ppn_dataplane.uplink_spi == 0 {
            return Err(Status::invalid_argument(
                "dataplane response missing uplink SPI",
            ));
        }
        if ppn_dataplane.egress_point_sock_addr.is_empty() {
            return Err(Status::invalid_argument(
                "dataplane response missing egress addresses",
            ));
        }
        Ok(Self { ppn_dataplane })
    }

    /// The user private IPs as parsed ranges.
    pub fn user_private_ip(&self) -> Result<Vec<IpRange>, Status> {
        self.ppn_dataplane
            .user_private_ip
            .iter()
            .map(PrivateIp::to_ip_range)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// update path info

/// Request body for the update-path-info endpoint.
#[derive(Debug, Clone, Default)]
pub struct UpdatePathInfoRequest {
    pub session_id: u32,
    pub uplink_mtu: u32,
    pub downlink_mtu: u32,
    pub apn_type: String,
    pub control_plane_sock_addr: String,
    /// Base64 signature over the path-info fields.
    pub mtu_update_signature: String,
}

impl UpdatePathInfoRequest {
    /// The exact byte string covered by `mtu_update_signature`.
    pub fn signed_data(session_id: u32, uplink_mtu: u32, downlink_mtu: u32) -> String {
        format!("path_info;{session_id};{uplink_mtu};{downlink_mtu}")
    }

    pub fn to_json(&self) -> String {
        json!({
            "apn_type": self.apn_type,
            "control_plane_sock_addr": self.control_plane_sock_addr,
            "downlink_mtu": self.downlink_mtu,
            "mtu_update_signature": self.mtu_update_signature,
            "session_id": self.session_id,
            "uplink_mtu": self.uplink_mtu,
        })
        .to_string()
    }
}
