//! Egress endpoint parsing and reattempt address selection.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use tracing::debug;

use crate::network::{AddressFamily, NetworkInfo};
use crate::status::Status;

/// IP family of a parsed endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

/// One egress address in both its wire form and parsed form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    raw: String,
    ip: IpAddr,
    port: u16,
}

impl Endpoint {
    /// Parses `"host:port"` or `"[v6]:port"`.
    pub fn parse(address: &str) -> Result<Self, Status> {
        let sock_addr: SocketAddr = address
            .parse()
            .map_err(|e| Status::invalid_argument(format!("bad endpoint {address:?}: {e}")))?;
        Ok(Self {
            raw: address.to_string(),
            ip: sock_addr.ip(),
            port: sock_addr.port(),
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn family(&self) -> IpFamily {
        match self.ip {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Chooses the egress endpoint for each datapath attempt.
///
/// Attempts alternate between address families, starting with IPv6 when the
/// egress offered one and the active network can carry it. A successful
/// datapath establishment resets the cursor.
#[derive(Debug, Default)]
pub struct AddressSelector {
    endpoints: Vec<Endpoint>,
    prefer_v6: bool,
}

impl AddressSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-arms the selector with the egress address list, filtered by what
    /// the active network supports.
    pub fn reset(
        &mut self,
        addresses: &[String],
        network_info: Option<&NetworkInfo>,
    ) -> Result<(), Status> {
        let mut endpoints = Vec::with_capacity(addresses.len());
        for address in addresses {
            endpoints.push(Endpoint::parse(address)?);
        }
        if let Some(family) = network_info.and_then(|n| n.address_family) {
            endpoints.retain(|e| match family {
                AddressFamily::V4 => e.family() == IpFamily::V4,
                AddressFamily::V6 => e.family() == IpFamily::V6,
                AddressFamily::V4V6 => true,
            });
        }
        self.prefer_v6 = endpoints.iter().any(|e| e.family() == IpFamily::V6);
        debug!(
            count = endpoints.len(),
            prefer_v6 = self.prefer_v6,
            "address selector reset"
        );
        self.endpoints = endpoints;
        Ok(())
    }

    /// Returns the endpoint for the next attempt and flips the family
    /// cursor.
    pub fn select(&mut self) -> Result<Endpoint, Status> {
        if self.endpoints.is_empty() {
            return Err(Status::failed_precondition("no egress addresses available"));
        }
        let wanted = if self.prefer_v6 {
            IpFamily::V6
        } else {
            IpFamily::V4
        };
        let endpoint = self
            .endpoints
            .iter()
            .find(|e| e.family() == wanted)
            .unwrap_or(&self.endpoints[0])
            .clone();
        // Only flip when the other family is actually present.
        let other = match endpoint.family() {
            IpFamily::V4 => IpFamily::V6,
            IpFamily::V6 => IpFamily::V4,
        };
        if self.endpoints.iter().any(|e| e.family() == other) {
            self.prefer_v6 = other == IpFamily::V6;
        }
        Ok(endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipv4() {
        let endpoint = Endpoint::parse("64.9.240.165:2153").unwrap();
        assert_eq!(endpoint.family(), IpFamily::V4);
        assert_eq!(endpoint.port(), 2153);
        assert_eq!(endpoint.raw(), "64.9.240.165:2153");
    }

    #[test]
    fn test_parse_ipv6() {
        let endpoint = Endpoint::parse("[2604:ca00:f001:4::5]:2153").unwrap();
        assert_eq!(endpoint.family(), IpFamily::V6);
        assert_eq!(endpoint.ip().to_string(), "2604:ca00:f001:4::5");
        assert_eq!(endpoint.port(), 2153);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Endpoint::parse("not-an-endpoint").is_err());
        assert!(Endpoint::parse("1.2.3.4").is_err());
        assert!(Endpoint::parse("").is_err());
    }

    fn both_families() -> Vec<String> {
        vec![
            "64.9.240.165:2153".to_string(),
            "[2604:ca00:f001:4::5]:2153".to_string(),
        ]
    }

    #[test]
    fn test_selector_alternates_families_starting_with_v6() {
        let mut selector = AddressSelector::new();
        selector.reset(&both_families(), None).unwrap();

        assert_eq!(selector.select().unwrap().family(), IpFamily::V6);
        assert_eq!(selector.select().unwrap().family(), IpFamily::V4);
        assert_eq!(selector.select().unwrap().family(), IpFamily::V6);
        assert_eq!(selector.select().unwrap().family(), IpFamily::V4);
    }

    #[test]
    fn test_selector_reset_restores_v6_preference() {
        let mut selector = AddressSelector::new();
        selector.reset(&both_families(), None).unwrap();
        let _ = selector.select().unwrap();
        selector.reset(&both_families(), None).unwrap();
        assert_eq!(selector.select().unwrap().family(), IpFamily::V6);
    }

    #[test]
    fn test_selector_v4_only_never_flips() {
        let mut selector = AddressSelector::new();
        selector
            .reset(&["64.9.240.165:2153".to_string()], None)
            .unwrap();
        for _ in 0..3 {
            assert_eq!(selector.select().unwrap().family(), IpFamily::V4);
        }
    }

    #[test]
    fn test_selector_respects_network_family() {
        let network = NetworkInfo {
            address_family: Some(AddressFamily::V4),
            ..NetworkInfo::default()
        };
        let mut selector = AddressSelector::new();
        selector.reset(&both_families(), Some(&network)).unwrap();
        assert_eq!(selector.select().unwrap().family(), IpFamily::V4);
        assert_eq!(selector.select().unwrap().family(), IpFamily::V4);
    }

    #[test]
    fn test_selector_empty_is_error() {
        let mut selector = AddressSelector::new();
        assert!(selector.select().is_err());
    }
}
