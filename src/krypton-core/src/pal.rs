//! Platform abstraction layer.
//!
//! The session core never touches the platform directly: TUN creation,
//! socket protection, OAuth and the datapath all live behind these traits.
//! The embedding application implements them; tests substitute fakes.
//!
//! Notification sinks are held as `Weak` references. The sink never owns the
//! emitter, so the cyclic callback graph (session ⇄ datapath, provision ⇄
//! auth/egress) cannot leak.

use std::sync::Weak;

use async_trait::async_trait;

use crate::config::KryptonConfig;
use crate::endpoint::Endpoint;
use crate::messages::AddEgressResponse;
use crate::network::{NetworkInfo, TunFdData};
use crate::status::Status;
use crate::telemetry::DatapathDebugInfo;
use krypton_crypto::{IpSecTransformParams, TransformParams};

/// Supplies OAuth tokens for the control-plane requests.
#[async_trait]
pub trait OAuthProvider: Send + Sync {
    async fn get_oauth_token(&self) -> Result<String, Status>;

    /// Invalidates a cached token after the backend rejected it.
    fn clear_oauth_token(&self, token: &str);
}

/// Platform VPN service: tunnel lifecycle and datapath construction.
pub trait VpnService: Send + Sync {
    /// Creates a datapath bound to this service.
    fn build_datapath(&self, config: &KryptonConfig) -> std::sync::Arc<dyn Datapath>;

    /// Creates (or replaces, when `force` is set) the TUN device.
    fn create_tunnel(&self, tun_fd_data: &TunFdData, force: bool) -> Result<(), Status>;

    fn close_tunnel(&self, force_fail_open: bool);

    fn is_tunnel_active(&self) -> bool;

    /// Opens a UDP socket bound to `network_info` and protected from being
    /// routed back into the tunnel.
    fn create_protected_network_socket(
        &self,
        network_info: &NetworkInfo,
        endpoint: &Endpoint,
    ) -> Result<std::net::UdpSocket, Status>;

    /// Installs kernel IPsec transforms, for datapaths that use them.
    fn configure_ipsec(&self, params: &IpSecTransformParams) -> Result<(), Status>;

    fn disable_keepalive(&self);
}

/// Inbound events from the datapath. Implemented by the session.
pub trait DatapathNotification: Send + Sync {
    fn datapath_established(&self);
    fn datapath_failed(&self, status: Status);
    fn datapath_permanent_failure(&self, status: Status);
    /// The datapath wants fresh key material.
    fn do_rekey(&self);
    fn do_uplink_mtu_update(&self, uplink_mtu: u32, tunnel_mtu: u32);
    fn do_downlink_mtu_update(&self, downlink_mtu: u32);
}

/// The encrypted datapath carrying user traffic. Valid for a single
/// session; callers recreate it after `stop`.
pub trait Datapath: Send + Sync {
    fn start(
        &self,
        egress_response: &AddEgressResponse,
        params: &TransformParams,
    ) -> Result<(), Status>;

    fn stop(&self);

    fn register_notification_handler(&self, handler: Weak<dyn DatapathNotification>);

    fn switch_network(
        &self,
        session_id: u32,
        endpoint: &Endpoint,
        network_info: &NetworkInfo,
        counter: u32,
    ) -> Result<(), Status>;

    /// Informs the datapath that the tunnel is about to be replaced.
    fn prepare_for_tunnel_switch(&self);

    /// Switches to the tunnel created since `prepare_for_tunnel_switch`.
    fn switch_tunnel(&self);

    fn set_key_materials(&self, params: &TransformParams) -> Result<(), Status>;

    fn get_debug_info(&self, debug_info: &mut DatapathDebugInfo);
}
