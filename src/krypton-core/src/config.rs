//! Client configuration.
//!
//! Immutable after construction. The embedder builds one of these (or loads
//! it from JSON) and hands it to every component; durations are stored as
//! plain integers so the config serializes without surprises.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use krypton_crypto::CipherSuite;
use serde::{Deserialize, Serialize};

/// Which datapath implementation the egress should prepare for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatapathProtocol {
    Bridge,
    #[default]
    IpSec,
    Ike,
}

impl DatapathProtocol {
    pub fn wire_name(self) -> &'static str {
        match self {
            DatapathProtocol::Bridge => "BRIDGE",
            DatapathProtocol::IpSec => "IPSEC",
            DatapathProtocol::Ike => "IKE",
        }
    }
}

/// Exit-location granularity requested from the auth service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpGeoLevel {
    #[default]
    Country,
    City,
}

fn default_true() -> bool {
    true
}

fn default_rekey_duration_secs() -> u64 {
    24 * 60 * 60
}

fn default_connecting_timer_secs() -> u64 {
    20
}

fn default_reattempt_delay_millis() -> u64 {
    500
}

fn default_max_reattempts() -> u32 {
    4
}

fn default_cipher_suite_key_length() -> u32 {
    128
}

/// Immutable client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KryptonConfig {
    /// Authentication (auth-and-sign) endpoint.
    pub zinc_url: String,
    /// Egress allocation endpoint.
    pub brass_url: String,
    /// Bootstrap metadata endpoint, used when public metadata is enabled.
    #[serde(default)]
    pub initial_data_url: String,
    /// Path-info (MTU) update endpoint.
    #[serde(default)]
    pub update_path_info_url: String,

    pub service_type: String,
    #[serde(default)]
    pub datapath_protocol: DatapathProtocol,
    #[serde(default)]
    pub ip_geo_level: IpGeoLevel,

    /// Allowed suffixes for the copper hostname returned by auth.
    #[serde(default)]
    pub copper_hostname_suffix: Vec<String>,
    /// Overrides any copper hostname the auth service returns.
    #[serde(default)]
    pub copper_hostname_override: Option<String>,
    /// Fallback copper hostname when auth does not return one.
    #[serde(default)]
    pub copper_controller_address: Option<String>,

    /// Forwarded as the X-Goog-Api-Key header when present.
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_true")]
    pub enable_blind_signing: bool,
    #[serde(default)]
    pub public_metadata_enabled: bool,
    #[serde(default)]
    pub dynamic_mtu_enabled: bool,
    #[serde(default)]
    pub debug_mode_allowed: bool,

    #[serde(default = "default_cipher_suite_key_length")]
    pub cipher_suite_key_length: u32,

    #[serde(default = "default_rekey_duration_secs")]
    pub rekey_duration_secs: u64,
    #[serde(default)]
    pub datapath_connecting_timer_enabled: bool,
    #[serde(default = "default_connecting_timer_secs")]
    pub datapath_connecting_timer_duration_secs: u64,
    #[serde(default = "default_reattempt_delay_millis")]
    pub datapath_reattempt_delay_millis: u64,
    #[serde(default = "default_max_reattempts")]
    pub max_datapath_reattempts: u32,
}

impl Default for KryptonConfig {
    fn default() -> Self {
        Self {
            zinc_url: String::new(),
            brass_url: String::new(),
            initial_data_url: String::new(),
            update_path_info_url: String::new(),
            service_type: String::new(),
            datapath_protocol: DatapathProtocol::default(),
            ip_geo_level: IpGeoLevel::default(),
            copper_hostname_suffix: Vec::new(),
            copper_hostname_override: None,
            copper_controller_address: None,
            api_key: None,
            enable_blind_signing: true,
            public_metadata_enabled: false,
            dynamic_mtu_enabled: false,
            debug_mode_allowed: false,
            cipher_suite_key_length: default_cipher_suite_key_length(),
            rekey_duration_secs: default_rekey_duration_secs(),
            datapath_connecting_timer_enabled: false,
            datapath_connecting_timer_duration_secs: default_connecting_timer_secs(),
            datapath_reattempt_delay_millis: default_reattempt_delay_millis(),
            max_datapath_reattempts: default_max_reattempts(),
        }
    }
}

impl KryptonConfig {
    /// Loads a config from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn rekey_duration(&self) -> Duration {
        Duration::from_secs(self.rekey_duration_secs)
    }

    pub fn datapath_connecting_timer_duration(&self) -> Duration {
        Duration::from_secs(self.datapath_connecting_timer_duration_secs)
    }

    pub fn datapath_reattempt_delay(&self) -> Duration {
        Duration::from_millis(self.datapath_reattempt_delay_millis)
    }

    pub fn cipher_suite(&self) -> CipherSuite {
        if self.cipher_suite_key_length == 256 {
            CipherSuite::Aes256Gcm
        } else {
            CipherSuite::Aes128Gcm
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = KryptonConfig::default();
        assert_eq!(config.rekey_duration(), Duration::from_secs(24 * 60 * 60));
        assert_eq!(config.datapath_reattempt_delay(), Duration::from_millis(500));
        assert_eq!(config.max_datapath_reattempts, 4);
        assert!(!config.datapath_connecting_timer_enabled);
        assert_eq!(
            config.datapath_connecting_timer_duration(),
            Duration::from_secs(20)
        );
        assert!(config.enable_blind_signing);
        assert!(!config.public_metadata_enabled);
        assert_eq!(config.cipher_suite(), CipherSuite::Aes128Gcm);
        assert_eq!(config.datapath_protocol, DatapathProtocol::IpSec);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "zinc_url": "https://auth.example.com/v1/authandsign",
                "brass_url": "https://egress.example.com/v1/addegress",
                "service_type": "service_type",
                "datapath_protocol": "bridge",
                "cipher_suite_key_length": 256,
                "rekey_duration_secs": 3600,
                "copper_hostname_suffix": [".example.com"]
            }}"#
        )
        .unwrap();

        let config = KryptonConfig::load(file.path()).unwrap();
        assert_eq!(config.datapath_protocol, DatapathProtocol::Bridge);
        assert_eq!(config.cipher_suite(), CipherSuite::Aes256Gcm);
        assert_eq!(config.rekey_duration(), Duration::from_secs(3600));
        assert_eq!(config.copper_hostname_suffix, vec![".example.com"]);
    }

    #[test]
    fn test_load_missing_file_is_error() {
        let err = KryptonConfig::load(Path::new("/nonexistent/krypton.json")).unwrap_err();
        assert!(err.to_string().contains("reading config"));
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(DatapathProtocol::Bridge.wire_name(), "BRIDGE");
        assert_eq!(DatapathProtocol::IpSec.wire_name(), "IPSEC");
        assert_eq!(DatapathProtocol::Ike.wire_name(), "IKE");
    }
}
