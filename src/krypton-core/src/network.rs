//! Network descriptors shared between the session and the platform layer.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::status::Status;

/// Kind of the underlying network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NetworkType {
    #[default]
    Unknown,
    Cellular,
    Wifi,
}

/// Address families a network can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressFamily {
    V4,
    V6,
    V4V6,
}

/// Identity of one platform network, as reported by the network monitor.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub network_id: i64,
    pub network_type: NetworkType,
    pub address_family: Option<AddressFamily>,
}

impl NetworkInfo {
    pub fn new(network_id: i64, network_type: NetworkType) -> Self {
        Self {
            network_id,
            network_type,
            address_family: None,
        }
    }
}

/// An IP address with an optional prefix length, e.g. `"10.2.2.123/32"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRange {
    pub address: IpAddr,
    pub prefix: Option<u8>,
}

impl IpRange {
    pub fn parse(text: &str) -> Result<Self, Status> {
        let (address, prefix) = match text.split_once('/') {
            Some((address, prefix)) => {
                let prefix: u8 = prefix
                    .parse()
                    .map_err(|_| Status::invalid_argument(format!("bad prefix in {text:?}")))?;
                (address, Some(prefix))
            }
            None => (text, None),
        };
        let address: IpAddr = address
            .parse()
            .map_err(|_| Status::invalid_argument(format!("bad IP address {text:?}")))?;
        if let Some(prefix) = prefix {
            let max = if address.is_ipv4() { 32 } else { 128 };
            if prefix > max {
                return Err(Status::invalid_argument(format!(
                    "prefix /{prefix} out of range for {text:?}"
                )));
            }
        }
        Ok(Self { address, prefix })
    }

    pub fn is_ipv4(&self) -> bool {
        self.address.is_ipv4()
    }
}

impl std::fmt::Display for IpRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.prefix {
            Some(prefix) => write!(f, "{}/{}", self.address, prefix),
            None => write!(f, "{}", self.address),
        }
    }
}

/// Everything the platform needs to build the TUN device. Recreated on
/// every tunnel update.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TunFdData {
    pub tunnel_ip_addresses: Vec<IpRange>,
    pub tunnel_dns_addresses: Vec<IpRange>,
    /// Set only when dynamic MTU is enabled.
    pub mtu: Option<u32>,
    pub is_metered: bool,
}

impl TunFdData {
    /// The DNS set pushed into every tunnel.
    pub fn default_dns_addresses() -> Vec<IpRange> {
        ["8.8.8.8/32", "8.8.4.4/32", "2001:4860:4860::8888/128", "2001:4860:4860::8844/128"]
            .iter()
            .map(|s| IpRange::parse(s).expect("static DNS addresses parse"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_range_parse_v4_with_prefix() {
        let range = IpRange::parse("10.2.2.123/32").unwrap();
        assert!(range.is_ipv4());
        assert_eq!(range.prefix, Some(32));
        assert_eq!(range.to_string(), "10.2.2.123/32");
    }

    #[test]
    fn test_ip_range_parse_v6_without_prefix() {
        let range = IpRange::parse("fec2:0001::3").unwrap();
        assert!(!range.is_ipv4());
        assert_eq!(range.prefix, None);
    }

    #[test]
    fn test_ip_range_rejects_bad_input() {
        assert!(IpRange::parse("not-an-ip").is_err());
        assert!(IpRange::parse("10.0.0.1/40").is_err());
        assert!(IpRange::parse("fec2::1/200").is_err());
    }

    #[test]
    fn test_default_dns_covers_both_families() {
        let dns = TunFdData::default_dns_addresses();
        assert_eq!(dns.len(), 4);
        assert_eq!(dns.iter().filter(|d| d.is_ipv4()).count(), 2);
    }

    #[test]
    fn test_network_info_equality_is_field_wise() {
        let a = NetworkInfo::new(123, NetworkType::Cellular);
        let b = NetworkInfo::new(123, NetworkType::Cellular);
        assert_eq!(a, b);
        let c = NetworkInfo::new(124, NetworkType::Cellular);
        assert_ne!(a, c);
    }
}
