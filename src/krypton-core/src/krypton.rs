//! Top-level assembly for embedders.
//!
//! `Krypton` owns the timer wheel, the notification looper and the session,
//! and exposes the handful of calls the embedding application drives:
//! start/stop, network changes, tunnel updates, telemetry and debug
//! snapshots. OS entrypoints (JNI, service shells) stay outside this crate
//! and forward into one constructed `Krypton` owned by their `main`.

use std::sync::{Arc, Weak};

use tracing::info;

use crate::auth::Auth;
use crate::config::KryptonConfig;
use crate::egress::EgressManager;
use crate::http::HttpFetch;
use crate::looper::Looper;
use crate::network::NetworkInfo;
use crate::pal::{OAuthProvider, VpnService};
use crate::session::{Session, SessionNotification};
use crate::status::Status;
use crate::telemetry::{KryptonDebugInfo, KryptonTelemetry};
use crate::timer::TimerManager;

/// One assembled client: session plus the plumbing it runs on.
pub struct Krypton {
    session: Arc<Session>,
    notification_looper: Arc<Looper>,
    timer_manager: Arc<TimerManager>,
}

impl Krypton {
    pub fn new(
        config: KryptonConfig,
        fetcher: Arc<dyn HttpFetch>,
        oauth: Arc<dyn OAuthProvider>,
        vpn_service: Arc<dyn VpnService>,
        notification: Weak<dyn SessionNotification>,
        network_info: Option<NetworkInfo>,
    ) -> Self {
        let timer_manager = Arc::new(TimerManager::new());
        let notification_looper = Arc::new(Looper::new("krypton-notification"));
        let auth = Auth::new(config.clone(), Arc::clone(&fetcher), oauth);
        let egress = EgressManager::new(config.clone(), Arc::clone(&fetcher));
        let session = Session::new(
            config,
            auth,
            egress,
            vpn_service,
            Arc::clone(&timer_manager),
            fetcher,
            notification,
            Arc::clone(&notification_looper),
            network_info,
        );
        Self {
            session,
            notification_looper,
            timer_manager,
        }
    }

    pub fn start(&self) {
        info!("starting krypton");
        self.session.start();
    }

    pub fn stop(&self, force_fail_open: bool) {
        info!(force_fail_open, "stopping krypton");
        self.session.stop(force_fail_open);
    }

    pub fn set_network(&self, network_info: NetworkInfo) -> Result<(), Status> {
        self.session.set_network(network_info)
    }

    pub fn set_no_network_available(&self) {
        self.session.set_no_network_available();
    }

    pub fn force_tunnel_update(&self) {
        self.session.force_tunnel_update();
    }

    pub fn collect_telemetry(&self, telemetry: &mut KryptonTelemetry) {
        self.session.collect_telemetry(telemetry);
    }

    pub fn get_debug_info(&self, debug_info: &mut KryptonDebugInfo) {
        self.session.get_debug_info(debug_info);
    }

    /// The session, for embedders that need direct access (e.g. inbound
    /// datapath events in tests).
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Timers currently armed, across the whole client.
    pub fn pending_timers(&self) -> usize {
        self.timer_manager.pending_count()
    }

    /// Waits for queued embedder notifications to drain.
    pub async fn drain_notifications(&self) {
        self.notification_looper.join().await;
    }
}
