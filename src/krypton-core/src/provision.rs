//! Provisioning: Auth then EgressManager.
//!
//! `start` creates fresh session key material and runs one authentication
//! round; on success the control-plane address is resolved and the egress
//! request goes out. `rekey` reruns the exchange with new key material,
//! signing the new public value with the previous round's key so the egress
//! can tie the rekey to the running session.
//!
//! Outcomes surface on the owner's looper as `ready_for_add_egress`,
//! `provisioned` and `provisioning_failure`.

use std::sync::{Arc, Mutex, Weak};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::{error, info};

use crate::auth::{Auth, AuthNotification};
use crate::config::{DatapathProtocol, KryptonConfig};
use crate::egress::{EgressManager, EgressNotification};
use crate::http::HttpFetch;
use crate::looper::Looper;
use crate::messages::{AddEgressResponse, PpnDataplaneRequestParams};
use crate::status::Status;
use crate::telemetry::{KryptonDebugInfo, KryptonTelemetry};
use krypton_crypto::{SessionCrypto, TransformParams};

/// Fallback copper hostname when neither auth nor config supplies one.
const DEFAULT_COPPER_ADDRESS: &str = "na4.p.k-tun.com";

const CONTROL_PLANE_PORT: u16 = 1849;

/// Sink for provisioning outcomes. Implemented by the session.
pub trait ProvisionNotification: Send + Sync {
    /// Authentication completed; the egress request is about to go out.
    fn ready_for_add_egress(&self, is_rekey: bool);
    fn provisioned(&self, egress_response: AddEgressResponse, is_rekey: bool);
    fn provisioning_failure(&self, status: Status, permanent: bool);
}

struct ProvisionInner {
    key_material: Option<SessionCrypto>,
    control_plane_sockaddr: String,
}

/// Sequences Auth and EgressManager into one provisioning exchange.
pub struct Provision {
    config: KryptonConfig,
    auth: Arc<Auth>,
    egress: Arc<EgressManager>,
    fetcher: Arc<dyn HttpFetch>,
    notification: Weak<dyn ProvisionNotification>,
    notification_looper: Arc<Looper>,
    inner: Mutex<ProvisionInner>,
    weak_self: Weak<Provision>,
}

/// Formats an IP address and port the way the wire expects.
fn host_port_string(ip: &str, port: u16) -> Result<String, Status> {
    let ip: std::net::IpAddr = ip
        .parse()
        .map_err(|_| Status::invalid_argument(format!("bad resolved address {ip:?}")))?;
    Ok(match ip {
        std::net::IpAddr::V4(v4) => format!("{v4}:{port}"),
        std::net::IpAddr::V6(v6) => format!("[{v6}]:{port}"),
    })
}

impl Provision {
    pub fn new(
        config: KryptonConfig,
        auth: Arc<Auth>,
        egress: Arc<EgressManager>,
        fetcher: Arc<dyn HttpFetch>,
        notification: Weak<dyn ProvisionNotification>,
        notification_looper: Arc<Looper>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Provision>| {
            let looper = Arc::new(Looper::new("provision"));
            auth.register_notification_handler(weak.clone(), Arc::clone(&looper));
            egress.register_notification_handler(weak.clone(), looper);
            Self {
                config,
                auth,
                egress,
                fetcher,
                notification,
                notification_looper,
                inner: Mutex::new(ProvisionInner {
                    key_material: None,
                    control_plane_sockaddr: String::new(),
                }),
                weak_self: weak.clone(),
            }
        })
    }

    /// Begins provisioning with fresh key material.
    pub fn start(&self) {
        info!("starting provisioning");
        self.inner.lock().unwrap().key_material = Some(SessionCrypto::new());
        self.auth.start(false);
    }

    /// Restarts authentication for a rekey; the active session is retained.
    pub fn rekey(&self) {
        if self.inner.lock().unwrap().key_material.is_none() {
            self.fail_with_status(Status::failed_precondition("key material is missing"), false);
            return;
        }
        self.auth.start(true);
    }

    /// Tears down both children. Idempotent.
    pub fn stop(&self) {
        self.auth.stop();
        self.egress.stop();
    }

    /// Signs `data` with the current rekey verification key.
    pub fn generate_signature(&self, data: &[u8]) -> Result<Vec<u8>, Status> {
        let inner = self.inner.lock().unwrap();
        let key = inner
            .key_material
            .as_ref()
            .ok_or_else(|| Status::failed_precondition("key material is missing"))?;
        Ok(key.generate_signature(data))
    }

    /// Key material for the datapath, derived from the current round.
    pub fn get_transform_params(&self) -> Result<TransformParams, Status> {
        let inner = self.inner.lock().unwrap();
        let key = inner
            .key_material
            .as_ref()
            .ok_or_else(|| Status::failed_precondition("key material is missing"))?;
        match self.config.datapath_protocol {
            DatapathProtocol::IpSec => Ok(key.ipsec_transform_params()?),
            DatapathProtocol::Bridge => {
                Ok(key.bridge_transform_params(self.config.cipher_suite())?)
            }
            DatapathProtocol::Ike => Err(Status::failed_precondition(
                "IKE sessions do not derive client transform params",
            )),
        }
    }

    pub fn get_apn_type(&self) -> String {
        self.auth.auth_response().apn_type
    }

    pub fn get_control_plane_sockaddr(&self) -> Result<String, Status> {
        let inner = self.inner.lock().unwrap();
        if inner.control_plane_sockaddr.is_empty() {
            return Err(Status::failed_precondition(
                "control plane sockaddr not set",
            ));
        }
        Ok(inner.control_plane_sockaddr.clone())
    }

    fn copper_hostname(&self) -> String {
        if let Some(hostname) = &self.config.copper_hostname_override {
            if !hostname.is_empty() {
                return hostname.clone();
            }
        }
        let from_auth = self.auth.auth_response().copper_controller_hostname;
        if !from_auth.is_empty() {
            return from_auth;
        }
        if let Some(hostname) = &self.config.copper_controller_address {
            if !hostname.is_empty() {
                return hostname.clone();
            }
        }
        DEFAULT_COPPER_ADDRESS.to_string()
    }

    fn ppn_dataplane_request(&self, is_rekey: bool) {
        info!(is_rekey, "doing PPN dataplane request");
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            // Rekey reuses the control-plane address chosen at initial
            // provisioning.
            if !is_rekey {
                let hostname = this.copper_hostname();
                info!(%hostname, "copper hostname for DNS lookup");
                let resolved = match this.fetcher.lookup_dns(&hostname).await {
                    Ok(resolved) => resolved,
                    Err(status) => {
                        this.fail_with_status(status, false);
                        return;
                    }
                };
                let sockaddr = match host_port_string(&resolved, CONTROL_PLANE_PORT) {
                    Ok(sockaddr) => sockaddr,
                    Err(status) => {
                        this.fail_with_status(status, false);
                        return;
                    }
                };
                info!(%sockaddr, "control plane sockaddr");
                this.inner.lock().unwrap().control_plane_sockaddr = sockaddr;
            }

            let params = match this.build_dataplane_params(is_rekey) {
                Ok(params) => params,
                Err(status) => {
                    this.fail_with_status(status, false);
                    return;
                }
            };
            if let Err(status) = this.egress.get_egress_node_for_ppn_ipsec(params) {
                error!("GetEgressNodeForPpnIpSec failed");
                this.fail_with_status(status, false);
            }
        });
    }

    fn build_dataplane_params(
        &self,
        is_rekey: bool,
    ) -> Result<PpnDataplaneRequestParams, Status> {
        let inner = self.inner.lock().unwrap();
        let key = inner
            .key_material
            .as_ref()
            .ok_or_else(|| Status::failed_precondition("key material is missing"))?;
        let auth_response = self.auth.auth_response();

        let mut params = PpnDataplaneRequestParams {
            is_rekey,
            control_plane_sockaddr: inner.control_plane_sockaddr.clone(),
            suite: self.config.cipher_suite(),
            dataplane_protocol: self.config.datapath_protocol,
            apn_type: auth_response.apn_type,
            // Always send the region token and sig even if it's empty.
            region_token_and_signature: auth_response.region_token_and_signature,
            dynamic_mtu_enabled: self.config.dynamic_mtu_enabled,
            client_public_value: key.public_value(),
            client_nonce: key.nonce(),
            downlink_spi: key.downlink_spi(),
            ..PpnDataplaneRequestParams::default()
        };

        if self.config.enable_blind_signing && self.config.public_metadata_enabled {
            let token = self
                .auth
                .signed_token()
                .ok_or_else(|| Status::failed_precondition("no signed tokens found"))?;
            params.unblinded_token = Some(token.plaintext_message);
            params.unblinded_token_signature = Some(BASE64.encode(&token.token));
            params.message_mask = Some(BASE64.encode(&token.message_mask));
            let initial_data = self.auth.initial_data_response();
            params.signing_key_version =
                Some(initial_data.at_public_metadata_public_key.key_version);
            params.public_metadata = Some(initial_data.public_metadata_info.public_metadata);
        }

        if is_rekey {
            let signature = key
                .rekey_signature()
                .ok_or_else(|| Status::failed_precondition("rekey signature is missing"))?;
            params.signature = Some(BASE64.encode(signature));
            params.previous_uplink_spi = Some(self.egress.uplink_spi());
        } else {
            params.rekey_verification_key = Some(BASE64.encode(key.rekey_verification_key()));
        }
        Ok(params)
    }

    fn notify_ready_for_add_egress(&self, is_rekey: bool) {
        let notification = self.notification.clone();
        self.notification_looper.post(move || {
            if let Some(notification) = notification.upgrade() {
                notification.ready_for_add_egress(is_rekey);
            }
        });
    }

    fn fail_with_status(&self, status: Status, permanent: bool) {
        let notification = self.notification.clone();
        self.notification_looper.post(move || {
            if let Some(notification) = notification.upgrade() {
                notification.provisioning_failure(status, permanent);
            }
        });
    }
}

impl AuthNotification for Provision {
    fn auth_successful(&self, is_rekey: bool) {
        info!(is_rekey, "authentication successful, fetching egress node details");
        if is_rekey {
            let mut inner = self.inner.lock().unwrap();
            let Some(old_key) = inner.key_material.take() else {
                drop(inner);
                self.fail_with_status(
                    Status::failed_precondition("key material is missing"),
                    false,
                );
                return;
            };
            // The previous key signs the new public value.
            let mut new_key = SessionCrypto::new();
            let signature = old_key.generate_signature(new_key.public_value_bytes());
            new_key.set_signature(signature);
            inner.key_material = Some(new_key);
        }
        self.notify_ready_for_add_egress(is_rekey);
        self.ppn_dataplane_request(is_rekey);
    }

    fn auth_failure(&self, status: Status) {
        error!(%status, "authentication failed");
        let permanent = status.is_permanent();
        self.fail_with_status(status, permanent);
    }
}

impl EgressNotification for Provision {
    fn egress_available(&self, is_rekey: bool) {
        info!("egress available");
        let egress_response = match self.egress.get_egress_session_details() {
            Ok(egress_response) => egress_response,
            Err(status) => {
                error!("error getting session details");
                self.fail_with_status(status, false);
                return;
            }
        };

        // The egress may pin a different control-plane address than the one
        // resolved from DNS.
        if let Some(sockaddr) = &egress_response.ppn_dataplane.control_plane_sock_addr {
            if !sockaddr.is_empty() {
                self.inner.lock().unwrap().control_plane_sockaddr = sockaddr.clone();
            }
        }

        if self.config.datapath_protocol != DatapathProtocol::Ike {
            let ppn = &egress_response.ppn_dataplane;
            if ppn.egress_point_public_value.is_empty() {
                self.fail_with_status(
                    Status::invalid_argument("missing egress_point_public_value"),
                    false,
                );
                return;
            }
            if ppn.server_nonce.is_empty() {
                self.fail_with_status(Status::invalid_argument("missing server_nonce"), false);
                return;
            }
            let mut inner = self.inner.lock().unwrap();
            let Some(key) = inner.key_material.as_mut() else {
                drop(inner);
                self.fail_with_status(
                    Status::failed_precondition("key material is missing"),
                    false,
                );
                return;
            };
            if let Err(e) =
                key.set_remote_key_material(&ppn.egress_point_public_value, &ppn.server_nonce)
            {
                error!("error setting remote key material");
                self.fail_with_status(Status::from(e), false);
                return;
            }
        }

        let notification = self.notification.clone();
        self.notification_looper.post(move || {
            if let Some(notification) = notification.upgrade() {
                notification.provisioned(egress_response, is_rekey);
            }
        });
    }

    fn egress_unavailable(&self, status: Status) {
        error!(%status, "egress unavailable");
        self.fail_with_status(status, false);
    }
}

impl Provision {
    pub fn collect_telemetry(&self, telemetry: &mut KryptonTelemetry) {
        self.auth.collect_telemetry(telemetry);
        self.egress.collect_telemetry(telemetry);
    }

    pub fn get_debug_info(&self, debug_info: &mut KryptonDebugInfo) {
        self.auth.get_debug_info(&mut debug_info.auth);
        self.egress.get_debug_info(&mut debug_info.egress);
    }
}
