//! The session state machine.
//!
//! A session represents one provisioned tunnel to an egress. It drives
//! Provision, owns the datapath lifecycle, reacts to network and MTU
//! events with bounded reconnection attempts, and schedules periodic
//! rekeys. All mutable state sits behind one mutex; long-running work
//! (HTTP, DNS, crypto) never runs under it. External notifications are
//! posted onto the embedder's looper in transition order.

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::{error, info, warn};

use crate::auth::Auth;
use crate::config::KryptonConfig;
use crate::egress::EgressManager;
use crate::endpoint::AddressSelector;
use crate::http::{AsyncHttpDispatcher, HttpFetch, HttpRequest};
use crate::looper::Looper;
use crate::messages::{AddEgressResponse, UpdatePathInfoRequest};
use crate::network::{NetworkInfo, TunFdData};
use crate::pal::{Datapath, DatapathNotification, VpnService};
use crate::provision::{Provision, ProvisionNotification};
use crate::status::Status;
use crate::telemetry::{record_latency, KryptonDebugInfo, KryptonTelemetry};
use crate::timer::TimerManager;

/// MTU for the TUN interface when dynamic MTU is enabled: a commonly used
/// MTU of 1500 minus tunnel overhead.
const DEFAULT_TUNNEL_MTU: u32 = 1395;

/// Lifecycle notifications delivered to the embedding application.
pub trait SessionNotification: Send + Sync {
    /// The control plane negotiated the tunnel. The datapath is not
    /// necessarily up yet.
    fn control_plane_connected(&self);
    /// The control plane is broken, which implies no dataplane either.
    fn control_plane_disconnected(&self, status: Status);
    /// Non-recoverable error; the session must be torn down.
    fn permanent_failure(&self, status: Status);
    fn datapath_connecting(&self);
    fn datapath_connected(&self);
    /// User traffic is not flowing; the control plane is still up.
    fn datapath_disconnected(&self, network: NetworkInfo, status: Status);
}

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initialized,
    EgressSessionCreated,
    ControlPlaneConnected,
    DataPlaneConnecting,
    DataPlaneConnected,
    SessionError,
    PermanentError,
    Stopped,
}

impl SessionState {
    pub fn name(self) -> &'static str {
        match self {
            SessionState::Initialized => "Initialized",
            SessionState::EgressSessionCreated => "EgressSessionCreated",
            SessionState::ControlPlaneConnected => "ControlPlaneConnected",
            SessionState::DataPlaneConnecting => "DataPlaneConnecting",
            SessionState::DataPlaneConnected => "DataPlaneConnected",
            SessionState::SessionError => "SessionError",
            SessionState::PermanentError => "PermanentError",
            SessionState::Stopped => "Stopped",
        }
    }

    fn is_connected(self) -> bool {
        matches!(
            self,
            SessionState::ControlPlaneConnected
                | SessionState::DataPlaneConnecting
                | SessionState::DataPlaneConnected
        )
    }
}

struct SessionInner {
    state: SessionState,
    latest_status: Option<Status>,
    latest_datapath_status: Option<Status>,
    datapath: Option<Arc<dyn Datapath>>,
    active_network_info: Option<NetworkInfo>,
    egress_response: Option<AddEgressResponse>,
    egress_node_sock_addresses: Vec<String>,
    user_private_ip: Vec<crate::network::IpRange>,
    uplink_spi: u32,
    address_selector: AddressSelector,
    rekey_timer_id: Option<u64>,
    reattempt_timer_id: Option<u64>,
    connecting_timer_id: Option<u64>,
    reattempt_count: u32,
    switch_network_counter: u32,
    network_switches: u32,
    successful_network_switches: u32,
    switching_network: bool,
    network_switch_start: Option<Instant>,
    network_switch_latencies: Vec<Duration>,
    uplink_mtu: u32,
    downlink_mtu: u32,
    tunnel_mtu: u32,
    successful_rekeys: u32,
}

/// The session to the copper/egress pair, and the state machine that
/// supervises its datapath.
pub struct Session {
    config: KryptonConfig,
    vpn_service: Arc<dyn VpnService>,
    timer_manager: Arc<TimerManager>,
    notification: Weak<dyn SessionNotification>,
    notification_looper: Arc<Looper>,
    looper: Arc<Looper>,
    provision: Arc<Provision>,
    http: AsyncHttpDispatcher,
    inner: Mutex<SessionInner>,
    weak_self: Weak<Session>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: KryptonConfig,
        auth: Arc<Auth>,
        egress: Arc<EgressManager>,
        vpn_service: Arc<dyn VpnService>,
        timer_manager: Arc<TimerManager>,
        fetcher: Arc<dyn HttpFetch>,
        notification: Weak<dyn SessionNotification>,
        notification_looper: Arc<Looper>,
        network_info: Option<NetworkInfo>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Session>| {
            let looper = Arc::new(Looper::new("session"));
            let provision = Provision::new(
                config.clone(),
                auth,
                egress,
                Arc::clone(&fetcher),
                weak.clone(),
                Arc::clone(&looper),
            );
            Self {
                config,
                vpn_service,
                timer_manager,
                notification,
                notification_looper,
                http: AsyncHttpDispatcher::new(fetcher, Arc::clone(&looper)),
                looper,
                provision,
                inner: Mutex::new(SessionInner {
                    state: SessionState::Initialized,
                    latest_status: None,
                    latest_datapath_status: None,
                    datapath: None,
                    active_network_info: network_info,
                    egress_response: None,
                    egress_node_sock_addresses: Vec::new(),
                    user_private_ip: Vec::new(),
                    uplink_spi: 0,
                    address_selector: AddressSelector::new(),
                    rekey_timer_id: None,
                    reattempt_timer_id: None,
                    connecting_timer_id: None,
                    reattempt_count: 0,
                    switch_network_counter: 0,
                    network_switches: 0,
                    successful_network_switches: 0,
                    switching_network: false,
                    network_switch_start: None,
                    network_switch_latencies: Vec::new(),
                    uplink_mtu: 0,
                    downlink_mtu: 0,
                    tunnel_mtu: DEFAULT_TUNNEL_MTU,
                    successful_rekeys: 0,
                }),
                weak_self: weak.clone(),
            }
        })
    }

    /// Starts provisioning. Valid only from `Initialized`.
    pub fn start(&self) {
        info!("starting session");
        self.provision.start();
    }

    /// Cancels all timers, stops the datapath and Provision, and moves to
    /// `Stopped`. No further notifications fire afterwards.
    pub fn stop(&self, force_fail_open: bool) {
        let mut inner = self.inner.lock().unwrap();
        self.cancel_rekey_timer(&mut inner);
        self.cancel_reattempt_timer(&mut inner);
        self.cancel_connecting_timer(&mut inner);
        self.provision.stop();
        self.http.cancel_all();
        if let Some(datapath) = inner.datapath.take() {
            datapath.stop();
        }
        self.vpn_service.close_tunnel(force_fail_open);
        self.set_state(&mut inner, SessionState::Stopped, None);
    }

    /// Records the active network and brings the datapath onto it. Below
    /// `ControlPlaneConnected` the request is buffered and replayed once
    /// provisioning completes.
    pub fn set_network(&self, network_info: NetworkInfo) -> Result<(), Status> {
        let mut inner = self.inner.lock().unwrap();
        match &inner.active_network_info {
            Some(previous) if inner.state.is_connected() => {
                info!(network_id = network_info.network_id, "switching network");
                // A switch is a field-wise change of the active network.
                if *previous != network_info {
                    inner.network_switches += 1;
                    inner.switching_network = true;
                    inner.network_switch_start = Some(Instant::now());
                }
            }
            _ => {
                info!(network_id = network_info.network_id, "setting network");
            }
        }
        inner.active_network_info = Some(network_info.clone());
        self.reset_all_datapath_reattempts(&mut inner);

        if !inner.state.is_connected() {
            info!("session is not in connected state, caching active network");
            return Ok(());
        }
        self.connect_datapath(&mut inner, network_info)
    }

    /// Clears the active network and parks the session on the control
    /// plane.
    pub fn set_no_network_available(&self) {
        let mut inner = self.inner.lock().unwrap();
        info!("no network available");
        inner.active_network_info = None;
        inner.switching_network = false;
        inner.network_switch_start = None;
        self.cancel_reattempt_timer(&mut inner);
        self.cancel_connecting_timer(&mut inner);
        if let Some(datapath) = inner.datapath.take() {
            datapath.stop();
        }
        if matches!(
            inner.state,
            SessionState::DataPlaneConnecting | SessionState::DataPlaneConnected
        ) {
            self.set_state(&mut inner, SessionState::ControlPlaneConnected, None);
        }
    }

    /// Rebuilds the TUN device even if nothing changed.
    pub fn force_tunnel_update(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.update_tunnel_if_needed(&mut inner, true);
    }

    /// Reattempt-timer callback.
    pub fn attempt_datapath_reconnect(&self) {
        let mut inner = self.inner.lock().unwrap();
        info!("datapath reconnect timer expiry");
        if inner.reattempt_timer_id.is_none() {
            info!("reattempt timer is already cancelled, not reconnecting");
            return;
        }
        inner.reattempt_timer_id = None;

        // The datapath may have come up while the timer was pending; the
        // network fd is never withdrawn during the wait.
        if inner.state == SessionState::DataPlaneConnected {
            info!("datapath is already connected, not reattempting");
            return;
        }
        let Some(network_info) = inner.active_network_info.clone() else {
            let status = inner
                .latest_datapath_status
                .clone()
                .unwrap_or_else(|| Status::internal("datapath failed"));
            self.notify_datapath_disconnected(&mut inner, NetworkInfo::default(), status);
            return;
        };
        if let Err(status) = self.connect_datapath(&mut inner, network_info) {
            error!(%status, "connect datapath failed");
        }
    }

    /// Connecting-timer callback: the datapath took too long to establish.
    pub fn handle_datapath_connecting_timeout(&self) {
        let mut inner = self.inner.lock().unwrap();
        info!("datapath connecting timer expiry");
        if inner.connecting_timer_id.is_none() {
            info!("datapath connecting timer is already cancelled");
            return;
        }
        inner.connecting_timer_id = None;
        if let Some(datapath) = inner.datapath.take() {
            datapath.stop();
        }
        self.handle_datapath_failure(
            &mut inner,
            Status::deadline_exceeded("timed out waiting for datapath to establish"),
        );
    }

    fn handle_rekey_timer_expiry(&self) {
        let mut inner = self.inner.lock().unwrap();
        info!("rekey timer expired");
        if inner.rekey_timer_id.is_none() {
            info!("rekey timer is already cancelled");
            return;
        }
        inner.rekey_timer_id = None;
        self.rekey(&mut inner);
    }

    fn rekey(&self, inner: &mut SessionInner) {
        if !inner.state.is_connected() {
            self.set_state(
                inner,
                SessionState::SessionError,
                Some(Status::failed_precondition(
                    "session is not in connected state for rekey",
                )),
            );
            return;
        }
        self.provision.rekey();
    }

    // ------------------------------------------------------------------
    // datapath bring-up

    fn connect_datapath(
        &self,
        inner: &mut SessionInner,
        network_info: NetworkInfo,
    ) -> Result<(), Status> {
        info!(
            network_type = ?network_info.network_type,
            "connecting datapath"
        );
        self.notify(|n| n.datapath_connecting());

        if inner.egress_response.is_none() {
            let status = Status::failed_precondition("add egress response is not initialized");
            self.set_state(inner, SessionState::SessionError, Some(status.clone()));
            return Err(status);
        }

        if let Err(status) = self.create_tunnel_if_needed(inner) {
            error!(%status, "tunnel creation failed");
            let state = if status.is_permanent() {
                SessionState::PermanentError
            } else {
                SessionState::SessionError
            };
            self.set_state(inner, state, Some(status.clone()));
            return Err(status);
        }

        if let Err(status) = self.ensure_datapath(inner) {
            error!(%status, "datapath initialization failed");
            let state = if status.is_permanent() {
                SessionState::PermanentError
            } else {
                SessionState::SessionError
            };
            self.set_state(inner, state, Some(status.clone()));
            return Err(status);
        }

        info!(
            reattempt = inner.reattempt_count,
            network_id = network_info.network_id,
            "selecting datapath address"
        );
        let endpoint = match inner.address_selector.select() {
            Ok(endpoint) => endpoint,
            Err(status) => {
                self.set_state(inner, SessionState::SessionError, Some(status.clone()));
                return Err(status);
            }
        };

        self.set_state(inner, SessionState::DataPlaneConnecting, None);
        if self.config.datapath_connecting_timer_enabled {
            self.start_connecting_timer(inner);
        }

        inner.switch_network_counter += 1;
        let counter = inner.switch_network_counter;
        let Some(datapath) = inner.datapath.clone() else {
            let status = Status::internal("datapath missing after initialization");
            self.set_state(inner, SessionState::SessionError, Some(status.clone()));
            return Err(status);
        };
        let result = datapath.switch_network(inner.uplink_spi, &endpoint, &network_info, counter);
        if let Err(status) = result {
            error!(%status, "switching networks failed");
            self.notify_datapath_disconnected(inner, network_info, status.clone());
            return Err(status);
        }
        Ok(())
    }

    /// Builds and starts the datapath if none is live.
    fn ensure_datapath(&self, inner: &mut SessionInner) -> Result<(), Status> {
        if inner.datapath.is_some() {
            return Ok(());
        }
        let egress_response = inner
            .egress_response
            .clone()
            .ok_or_else(|| Status::failed_precondition("add egress response is not initialized"))?;
        let params = self.provision.get_transform_params()?;
        let datapath = self.vpn_service.build_datapath(&self.config);
        let handler: Weak<dyn DatapathNotification> = self.weak_self.clone();
        datapath.register_notification_handler(handler);
        datapath.start(&egress_response, &params)?;
        inner.datapath = Some(datapath);
        Ok(())
    }

    fn create_tunnel_if_needed(&self, inner: &SessionInner) -> Result<(), Status> {
        if self.vpn_service.is_tunnel_active() {
            info!("not creating tun fd as it's already present");
            return Ok(());
        }
        self.create_tunnel(inner, false)
    }

    fn create_tunnel(&self, inner: &SessionInner, force: bool) -> Result<(), Status> {
        let tun_fd_data = self.build_tun_fd_data(inner)?;
        self.vpn_service.create_tunnel(&tun_fd_data, force)
    }

    fn build_tun_fd_data(&self, inner: &SessionInner) -> Result<TunFdData, Status> {
        if inner.egress_response.is_none() {
            return Err(Status::failed_precondition(
                "add egress response is not initialized",
            ));
        }
        if inner.user_private_ip.is_empty() {
            return Err(Status::invalid_argument("missing user private IP"));
        }
        Ok(TunFdData {
            tunnel_ip_addresses: inner.user_private_ip.clone(),
            tunnel_dns_addresses: TunFdData::default_dns_addresses(),
            mtu: self.config.dynamic_mtu_enabled.then_some(inner.tunnel_mtu),
            is_metered: false,
        })
    }

    fn update_tunnel_if_needed(&self, inner: &mut SessionInner, force: bool) {
        if !self.vpn_service.is_tunnel_active() {
            info!("no active tunnel to update");
            return;
        }
        let Some(datapath) = inner.datapath.clone() else {
            warn!("no datapath for tunnel update");
            return;
        };
        datapath.prepare_for_tunnel_switch();
        if let Err(status) = self.create_tunnel(inner, force) {
            error!(%status, "tunnel update failed");
            datapath.stop();
            inner.datapath = None;
            let state = if status.is_permanent() {
                SessionState::PermanentError
            } else {
                SessionState::SessionError
            };
            self.set_state(inner, state, Some(status));
            return;
        }
        datapath.switch_tunnel();
    }

    // ------------------------------------------------------------------
    // failure handling

    fn handle_datapath_failure(&self, inner: &mut SessionInner, status: Status) {
        if inner.active_network_info.is_none() {
            // The active network should never go from set to unset while a
            // datapath is live; tolerate the race anyway.
            info!("received datapath event after network info was reset");
            return;
        }

        error!(%status, "datapath failed");
        inner.latest_datapath_status = Some(status.clone());

        if inner.reattempt_count >= self.config.max_datapath_reattempts {
            error!("not reattempting datapath connection, exhausted all attempts");
            let network_info = inner.active_network_info.clone().unwrap_or_default();
            self.notify_datapath_disconnected(inner, network_info, status);
            return;
        }

        info!(
            attempt = inner.reattempt_count,
            "datapath attempt failed, scheduling reattempt"
        );
        inner.reattempt_count += 1;
        self.set_state(inner, SessionState::DataPlaneConnecting, Some(status));
        self.start_reattempt_timer(inner);
    }

    fn notify_datapath_disconnected(
        &self,
        inner: &mut SessionInner,
        network_info: NetworkInfo,
        status: Status,
    ) {
        error!(%status, "datapath disconnected");
        self.cancel_connecting_timer(inner);
        self.cancel_reattempt_timer(inner);
        if let Some(datapath) = inner.datapath.take() {
            datapath.stop();
        }
        self.vpn_service.close_tunnel(false);
        self.set_state(inner, SessionState::ControlPlaneConnected, Some(status.clone()));
        self.notify(move |n| n.datapath_disconnected(network_info, status));
    }

    fn reset_all_datapath_reattempts(&self, inner: &mut SessionInner) {
        info!(
            addresses = inner.egress_node_sock_addresses.len(),
            has_network = inner.active_network_info.is_some(),
            "resetting all datapath reattempts"
        );
        self.cancel_reattempt_timer(inner);
        inner.reattempt_count = 0;
        let addresses = inner.egress_node_sock_addresses.clone();
        let network_info = inner.active_network_info.clone();
        if let Err(status) = inner
            .address_selector
            .reset(&addresses, network_info.as_ref())
        {
            warn!(%status, "failed to reset address selector");
        }
    }

    // ------------------------------------------------------------------
    // timers

    fn start_rekey_timer(&self, inner: &mut SessionInner) {
        self.cancel_rekey_timer(inner);
        info!("starting rekey timer");
        let weak = self.weak_self.clone();
        let id = self.timer_manager.start_timer(
            self.config.rekey_duration(),
            &self.looper,
            "Rekey",
            move || {
                if let Some(session) = weak.upgrade() {
                    session.handle_rekey_timer_expiry();
                }
            },
        );
        inner.rekey_timer_id = Some(id);
    }

    fn start_reattempt_timer(&self, inner: &mut SessionInner) {
        self.cancel_reattempt_timer(inner);
        info!("starting datapath reattempt timer");
        let weak = self.weak_self.clone();
        let id = self.timer_manager.start_timer(
            self.config.datapath_reattempt_delay(),
            &self.looper,
            "DatapathReattempt",
            move || {
                if let Some(session) = weak.upgrade() {
                    session.attempt_datapath_reconnect();
                }
            },
        );
        inner.reattempt_timer_id = Some(id);
    }

    fn start_connecting_timer(&self, inner: &mut SessionInner) {
        self.cancel_connecting_timer(inner);
        info!("starting datapath connecting timer");
        let weak = self.weak_self.clone();
        let id = self.timer_manager.start_timer(
            self.config.datapath_connecting_timer_duration(),
            &self.looper,
            "DatapathConnecting",
            move || {
                if let Some(session) = weak.upgrade() {
                    session.handle_datapath_connecting_timeout();
                }
            },
        );
        inner.connecting_timer_id = Some(id);
    }

    fn cancel_rekey_timer(&self, inner: &mut SessionInner) {
        if let Some(id) = inner.rekey_timer_id.take() {
            self.timer_manager.cancel_timer(id);
        }
    }

    fn cancel_reattempt_timer(&self, inner: &mut SessionInner) {
        if let Some(id) = inner.reattempt_timer_id.take() {
            self.timer_manager.cancel_timer(id);
        }
    }

    fn cancel_connecting_timer(&self, inner: &mut SessionInner) {
        if let Some(id) = inner.connecting_timer_id.take() {
            self.timer_manager.cancel_timer(id);
        }
    }

    // ------------------------------------------------------------------
    // MTU updates

    fn send_update_path_info(&self, inner: &SessionInner) -> Result<(), Status> {
        let session_id = inner.uplink_spi;
        let uplink_mtu = inner.uplink_mtu;
        let downlink_mtu = inner.downlink_mtu;
        let signed_data = UpdatePathInfoRequest::signed_data(session_id, uplink_mtu, downlink_mtu);
        let signature = self.provision.generate_signature(signed_data.as_bytes())?;
        let request = UpdatePathInfoRequest {
            session_id,
            uplink_mtu,
            downlink_mtu,
            apn_type: self.provision.get_apn_type(),
            control_plane_sock_addr: self.provision.get_control_plane_sockaddr()?,
            mtu_update_signature: BASE64.encode(signature),
        };

        let mut http_request =
            HttpRequest::post_json(self.config.update_path_info_url.clone(), request.to_json());
        if let Some(api_key) = &self.config.api_key {
            http_request = http_request.with_header("X-Goog-Api-Key", api_key.clone());
        }
        // Non-2xx is logged but never disconnects.
        self.http.post_json_async(http_request, |outcome| match outcome {
            Ok(response) if response.is_success() => {
                info!("updating path info completed successfully");
            }
            Ok(response) => {
                error!(status = %response.error_status(None), "updating path info failed");
            }
            Err(status) => {
                error!(%status, "updating path info failed");
            }
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // state plumbing

    fn set_state(&self, inner: &mut SessionInner, state: SessionState, status: Option<Status>) {
        info!(
            from = inner.state.name(),
            to = state.name(),
            "session state transition"
        );
        let previous = inner.state;
        inner.state = state;
        inner.latest_status = status.clone();

        // The rekey timer is armed exactly while the dataplane is up.
        if previous == SessionState::DataPlaneConnected && state != SessionState::DataPlaneConnected
        {
            self.cancel_rekey_timer(inner);
        }
        if state == SessionState::DataPlaneConnected && previous != SessionState::DataPlaneConnected
        {
            self.start_rekey_timer(inner);
        }

        match state {
            SessionState::ControlPlaneConnected => {
                // Re-entering from a dataplane failure is not a new
                // control-plane connection.
                if previous == SessionState::EgressSessionCreated {
                    self.notify(|n| n.control_plane_connected());
                }
            }
            SessionState::SessionError => {
                let status =
                    status.unwrap_or_else(|| Status::internal("session error without status"));
                self.notify(move |n| n.control_plane_disconnected(status));
            }
            SessionState::PermanentError => {
                let status =
                    status.unwrap_or_else(|| Status::internal("permanent error without status"));
                self.notify(move |n| n.permanent_failure(status));
            }
            _ => {}
        }
    }

    fn notify(&self, f: impl FnOnce(Arc<dyn SessionNotification>) + Send + 'static) {
        let notification = self.notification.clone();
        self.notification_looper.post(move || {
            if let Some(notification) = notification.upgrade() {
                f(notification);
            }
        });
    }

    // ------------------------------------------------------------------
    // rekey completion

    fn rekey_datapath(&self, inner: &mut SessionInner) {
        info!("successful response from egress for rekey");
        let params = match self.provision.get_transform_params() {
            Ok(params) => params,
            Err(status) => {
                self.set_state(inner, SessionState::SessionError, Some(status));
                return;
            }
        };
        let Some(datapath) = inner.datapath.clone() else {
            error!("no datapath found while rekeying");
            self.set_state(
                inner,
                SessionState::SessionError,
                Some(Status::internal("no datapath found while rekeying")),
            );
            return;
        };
        if let Err(status) = datapath.set_key_materials(&params) {
            self.set_state(inner, SessionState::SessionError, Some(status));
            return;
        }
        info!("rekey is successful");
        inner.successful_rekeys += 1;
        self.start_rekey_timer(inner);
    }

    // ------------------------------------------------------------------
    // telemetry and debug

    pub fn collect_telemetry(&self, telemetry: &mut KryptonTelemetry) {
        {
            let mut inner = self.inner.lock().unwrap();
            telemetry.successful_rekeys += std::mem::take(&mut inner.successful_rekeys);
            telemetry.network_switches += std::mem::take(&mut inner.network_switches);
            telemetry.successful_network_switches +=
                std::mem::take(&mut inner.successful_network_switches);
            telemetry
                .network_switch_latencies
                .append(&mut inner.network_switch_latencies);
        }
        self.provision.collect_telemetry(telemetry);
    }

    pub fn get_debug_info(&self, debug_info: &mut KryptonDebugInfo) {
        {
            let inner = self.inner.lock().unwrap();
            debug_info.session.state = inner.state.name().to_string();
            debug_info.session.status = inner
                .latest_status
                .as_ref()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "OK".to_string());
            debug_info.session.active_network = inner.active_network_info.clone();
            debug_info.session.successful_rekeys = inner.successful_rekeys;
            debug_info.session.network_switches = inner.network_switches;
            if let Some(datapath) = &inner.datapath {
                datapath.get_debug_info(&mut debug_info.session.datapath);
            }
        }
        self.provision.get_debug_info(debug_info);
    }

    // ------------------------------------------------------------------
    // test-only accessors

    pub fn state_test_only(&self) -> SessionState {
        self.inner.lock().unwrap().state
    }

    pub fn latest_status_test_only(&self) -> Option<Status> {
        self.inner.lock().unwrap().latest_status.clone()
    }

    pub fn datapath_reattempt_count_test_only(&self) -> u32 {
        self.inner.lock().unwrap().reattempt_count
    }

    pub fn rekey_timer_armed_test_only(&self) -> bool {
        self.inner.lock().unwrap().rekey_timer_id.is_some()
    }

    pub fn reattempt_timer_armed_test_only(&self) -> bool {
        self.inner.lock().unwrap().reattempt_timer_id.is_some()
    }

    pub fn connecting_timer_armed_test_only(&self) -> bool {
        self.inner.lock().unwrap().connecting_timer_id.is_some()
    }

    pub fn active_network_info_test_only(&self) -> Option<NetworkInfo> {
        self.inner.lock().unwrap().active_network_info.clone()
    }

    pub fn uplink_mtu_test_only(&self) -> u32 {
        self.inner.lock().unwrap().uplink_mtu
    }

    pub fn downlink_mtu_test_only(&self) -> u32 {
        self.inner.lock().unwrap().downlink_mtu
    }

    pub fn tunnel_mtu_test_only(&self) -> u32 {
        self.inner.lock().unwrap().tunnel_mtu
    }
}

impl ProvisionNotification for Session {
    fn ready_for_add_egress(&self, is_rekey: bool) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == SessionState::Stopped {
            return;
        }
        if !is_rekey && inner.state == SessionState::Initialized {
            self.set_state(&mut inner, SessionState::EgressSessionCreated, None);
        }
    }

    fn provisioned(&self, egress_response: AddEgressResponse, is_rekey: bool) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == SessionState::Stopped {
            return;
        }
        info!(is_rekey, "establishing PPN dataplane");
        inner.uplink_spi = egress_response.ppn_dataplane.uplink_spi;

        if !is_rekey {
            let user_private_ip = match egress_response.user_private_ip() {
                Ok(user_private_ip) => user_private_ip,
                Err(status) => {
                    self.set_state(&mut inner, SessionState::SessionError, Some(status));
                    return;
                }
            };
            inner.egress_node_sock_addresses =
                egress_response.ppn_dataplane.egress_point_sock_addr.clone();
            inner.user_private_ip = user_private_ip;
            inner.egress_response = Some(egress_response);
            self.reset_all_datapath_reattempts(&mut inner);
            self.set_state(&mut inner, SessionState::ControlPlaneConnected, None);

            let Some(network_info) = inner.active_network_info.clone() else {
                info!("there is no active network info, waiting for SetNetwork");
                return;
            };
            info!("active network is available, switching the network");
            if let Err(status) = self.connect_datapath(&mut inner, network_info) {
                error!(%status, "switching datapath failed");
            }
            return;
        }

        inner.egress_response = Some(egress_response);
        self.rekey_datapath(&mut inner);
    }

    fn provisioning_failure(&self, status: Status, permanent: bool) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == SessionState::Stopped {
            return;
        }
        let state = if permanent {
            SessionState::PermanentError
        } else {
            SessionState::SessionError
        };
        self.set_state(&mut inner, state, Some(status));
    }
}

impl DatapathNotification for Session {
    fn datapath_established(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == SessionState::Stopped {
            return;
        }
        info!("datapath is established");
        self.cancel_connecting_timer(&mut inner);
        self.set_state(&mut inner, SessionState::DataPlaneConnected, None);
        if inner.switching_network {
            inner.successful_network_switches += 1;
            if let Some(start) = inner.network_switch_start.take() {
                record_latency(start, &mut inner.network_switch_latencies, "network_switch");
            }
            inner.switching_network = false;
        }
        self.reset_all_datapath_reattempts(&mut inner);
        self.notify(|n| n.datapath_connected());
    }

    fn datapath_failed(&self, status: Status) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == SessionState::Stopped {
            return;
        }
        self.cancel_connecting_timer(&mut inner);
        self.handle_datapath_failure(&mut inner, status);
    }

    fn datapath_permanent_failure(&self, status: Status) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == SessionState::Stopped {
            return;
        }
        error!(%status, "datapath has permanent failure");
        // No reattempts; the embedder decides whether to build a new
        // session.
        let network_info = inner.active_network_info.clone().unwrap_or_default();
        self.notify_datapath_disconnected(&mut inner, network_info, status);
    }

    fn do_rekey(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == SessionState::Stopped {
            return;
        }
        self.rekey(&mut inner);
    }

    fn do_uplink_mtu_update(&self, uplink_mtu: u32, tunnel_mtu: u32) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != SessionState::DataPlaneConnected {
            info!("ignoring uplink MTU update in unconnected state");
            return;
        }
        if tunnel_mtu != inner.tunnel_mtu {
            info!(
                from = inner.tunnel_mtu,
                to = tunnel_mtu,
                "updating tunnel MTU"
            );
            inner.tunnel_mtu = tunnel_mtu;
            self.update_tunnel_if_needed(&mut inner, false);
        }
        if uplink_mtu != inner.uplink_mtu {
            info!(from = inner.uplink_mtu, to = uplink_mtu, "updating uplink MTU");
            inner.uplink_mtu = uplink_mtu;
        }
    }

    fn do_downlink_mtu_update(&self, downlink_mtu: u32) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != SessionState::DataPlaneConnected {
            info!("ignoring downlink MTU update in unconnected state");
            return;
        }
        if downlink_mtu != inner.downlink_mtu {
            info!(
                from = inner.downlink_mtu,
                to = downlink_mtu,
                "updating downlink MTU"
            );
            inner.downlink_mtu = downlink_mtu;
            if let Err(status) = self.send_update_path_info(&inner) {
                error!(%status, "sending update path info failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(SessionState::Initialized.name(), "Initialized");
        assert_eq!(SessionState::DataPlaneConnecting.name(), "DataPlaneConnecting");
        assert_eq!(SessionState::PermanentError.name(), "PermanentError");
    }

    #[test]
    fn test_connected_state_set() {
        assert!(SessionState::ControlPlaneConnected.is_connected());
        assert!(SessionState::DataPlaneConnecting.is_connected());
        assert!(SessionState::DataPlaneConnected.is_connected());
        assert!(!SessionState::Initialized.is_connected());
        assert!(!SessionState::SessionError.is_connected());
        assert!(!SessionState::Stopped.is_connected());
    }
}
