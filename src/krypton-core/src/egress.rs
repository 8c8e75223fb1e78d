//! Egress allocation.
//!
//! One brass POST per request: the session's ephemeral public value and
//! auth materials go out, a dataplane descriptor comes back. Exactly one of
//! `egress_available` / `egress_unavailable` fires per request.

use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use tracing::{error, info, warn};

use crate::config::KryptonConfig;
use crate::http::{AsyncHttpDispatcher, HttpFetch, HttpRequest, HttpResponse};
use crate::looper::Looper;
use crate::messages::{AddEgressRequest, AddEgressResponse, PpnDataplaneRequestParams};
use crate::status::Status;
use crate::telemetry::{record_latency, EgressDebugInfo, KryptonTelemetry};

/// Sink for the outcome of an egress request.
pub trait EgressNotification: Send + Sync {
    fn egress_available(&self, is_rekey: bool);
    fn egress_unavailable(&self, status: Status);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initialized,
    EgressSessionCreated,
    EgressSessionError,
}

impl State {
    fn name(self) -> &'static str {
        match self {
            State::Initialized => "Initialized",
            State::EgressSessionCreated => "EgressSessionCreated",
            State::EgressSessionError => "EgressSessionError",
        }
    }
}

struct EgressInner {
    state: State,
    stopped: bool,
    egress_response: Option<AddEgressResponse>,
    uplink_spi: u32,
    latest_status: Option<Status>,
    latencies: Vec<std::time::Duration>,
    request_time: Option<Instant>,
    notification: Option<(Weak<dyn EgressNotification>, Arc<Looper>)>,
}

/// Requests an egress allocation from brass and owns the response.
pub struct EgressManager {
    config: KryptonConfig,
    http: AsyncHttpDispatcher,
    inner: Mutex<EgressInner>,
}

impl EgressManager {
    pub fn new(config: KryptonConfig, fetcher: Arc<dyn HttpFetch>) -> Arc<Self> {
        let looper = Arc::new(Looper::new("egress"));
        Arc::new(Self {
            config,
            http: AsyncHttpDispatcher::new(fetcher, looper),
            inner: Mutex::new(EgressInner {
                state: State::Initialized,
                stopped: false,
                egress_response: None,
                uplink_spi: 0,
                latest_status: None,
                latencies: Vec::new(),
                request_time: None,
                notification: None,
            }),
        })
    }

    /// Registers the sink; outcomes are posted onto `looper`.
    pub fn register_notification_handler(
        &self,
        handler: Weak<dyn EgressNotification>,
        looper: Arc<Looper>,
    ) {
        self.inner.lock().unwrap().notification = Some((handler, looper));
    }

    pub fn stop(&self) {
        info!("egress manager stop");
        self.inner.lock().unwrap().stopped = true;
        self.http.cancel_all();
    }

    /// The uplink SPI saved from the initial (non-rekey) allocation.
    pub fn uplink_spi(&self) -> u32 {
        self.inner.lock().unwrap().uplink_spi
    }

    pub fn get_egress_session_details(&self) -> Result<AddEgressResponse, Status> {
        self.inner
            .lock()
            .unwrap()
            .egress_response
            .clone()
            .ok_or_else(|| Status::not_found("no egress response found"))
    }

    /// Issues one add-egress request.
    pub fn get_egress_node_for_ppn_ipsec(
        self: &Arc<Self>,
        params: PpnDataplaneRequestParams,
    ) -> Result<(), Status> {
        let is_rekey = params.is_rekey;
        self.inner.lock().unwrap().request_time = Some(Instant::now());
        let mut http_request =
            HttpRequest::post_json(self.config.brass_url.clone(), AddEgressRequest::encode(&params));
        if let Some(api_key) = &self.config.api_key {
            http_request = http_request.with_header("X-Goog-Api-Key", api_key.clone());
        }

        let handler_this = Arc::clone(self);
        self.http.post_json_async(http_request, move |outcome| {
            handler_this.decode_add_egress_response(is_rekey, outcome);
        });
        Ok(())
    }

    fn decode_add_egress_response(
        self: &Arc<Self>,
        is_rekey: bool,
        outcome: Result<HttpResponse, Status>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(request_time) = inner.request_time.take() {
            record_latency(request_time, &mut inner.latencies, "egress");
        }
        info!(is_rekey, "got add egress response");
        if inner.stopped {
            warn!("egress manager is already cancelled, ignoring response");
            return;
        }

        let response = match outcome {
            Ok(response) => response,
            Err(status) => {
                self.fail(&mut inner, status);
                return;
            }
        };
        if !response.is_success() {
            let status = response.error_status(Some(format!(
                "AddEgressRequest failed with code {}: Content obfuscated",
                response.status_code
            )));
            self.fail(&mut inner, status);
            return;
        }

        let egress_response = match AddEgressResponse::from_json(&response.body) {
            Ok(egress_response) => egress_response,
            Err(status) => {
                error!("error decoding add egress response");
                self.fail(&mut inner, status);
                return;
            }
        };

        if inner.egress_response.is_some() {
            info!("overwriting add egress response");
        }
        // The SPI only changes on a fresh allocation, never on rekey.
        if !is_rekey {
            inner.uplink_spi = egress_response.ppn_dataplane.uplink_spi;
        }
        inner.egress_response = Some(egress_response);
        self.set_state(&mut inner, State::EgressSessionCreated);

        if let Some((handler, looper)) = &inner.notification {
            let handler = handler.clone();
            looper.post(move || {
                if let Some(handler) = handler.upgrade() {
                    handler.egress_available(is_rekey);
                }
            });
        }
    }

    fn set_state(&self, inner: &mut EgressInner, state: State) {
        info!(
            from = inner.state.name(),
            to = state.name(),
            "egress state transition"
        );
        inner.state = state;
    }

    fn fail(&self, inner: &mut EgressInner, status: Status) {
        inner.latest_status = Some(status.clone());
        self.set_state(inner, State::EgressSessionError);
        if let Some((handler, looper)) = &inner.notification {
            let handler = handler.clone();
            looper.post(move || {
                if let Some(handler) = handler.upgrade() {
                    handler.egress_unavailable(status);
                }
            });
        }
    }

    pub fn collect_telemetry(&self, telemetry: &mut KryptonTelemetry) {
        let mut inner = self.inner.lock().unwrap();
        telemetry.egress_latencies.append(&mut inner.latencies);
    }

    pub fn get_debug_info(&self, debug_info: &mut EgressDebugInfo) {
        let inner = self.inner.lock().unwrap();
        debug_info.state = inner.state.name().to_string();
        debug_info.status = inner
            .latest_status
            .as_ref()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "OK".to_string());
        debug_info.latencies = inner.latencies.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Code;
    use async_trait::async_trait;
    use std::time::Duration;

    type FetchFn = dyn Fn(HttpRequest) -> Result<HttpResponse, Status> + Send + Sync;

    struct ScriptedFetcher {
        handler: Box<FetchFn>,
    }

    #[async_trait]
    impl HttpFetch for ScriptedFetcher {
        async fn post_json(&self, request: HttpRequest) -> Result<HttpResponse, Status> {
            (self.handler)(request)
        }

        async fn lookup_dns(&self, _hostname: &str) -> Result<String, Status> {
            Ok("192.0.2.1".to_string())
        }
    }

    #[derive(Default)]
    struct Events {
        events: Mutex<Vec<String>>,
    }

    impl Events {
        async fn wait_for(&self, expected: &str) {
            for _ in 0..200 {
                if self.events.lock().unwrap().iter().any(|e| e == expected) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!(
                "timed out waiting for {expected:?}, saw {:?}",
                self.events.lock().unwrap()
            );
        }
    }

    impl EgressNotification for Events {
        fn egress_available(&self, is_rekey: bool) {
            self.events
                .lock()
                .unwrap()
                .push(format!("available rekey={is_rekey}"));
        }

        fn egress_unavailable(&self, status: Status) {
            self.events
                .lock()
                .unwrap()
                .push(format!("unavailable {:?}", status.code));
        }
    }

    fn config() -> KryptonConfig {
        KryptonConfig {
            brass_url: "https://egress.example.com/v1/addegress".into(),
            service_type: "service_type".into(),
            ..KryptonConfig::default()
        }
    }

    fn egress_body() -> String {
        serde_json::json!({
            "ppn_dataplane": {
                "user_private_ip": [{"ipv4_range": "10.2.2.123/32"}],
                "egress_point_sock_addr": ["64.9.240.165:2153", "[2604:ca00:f001:4::5]:2153"],
                "egress_point_public_value": "a22j+91TxHtS5qa625KCD5ybsyzPR1wkTDWHV2qSQQc=",
                "server_nonce": "Uzt2lEzyvZYzjLAP3E+dAA==",
                "uplink_spi": 123,
                "expiry": "2020-08-07T01:06:13+00:00"
            }
        })
        .to_string()
    }

    fn manager_with(
        handler: impl Fn(HttpRequest) -> Result<HttpResponse, Status> + Send + Sync + 'static,
    ) -> (Arc<EgressManager>, Arc<Events>, Arc<Looper>) {
        let fetcher = Arc::new(ScriptedFetcher {
            handler: Box::new(handler),
        });
        let manager = EgressManager::new(config(), fetcher);
        let events = Arc::new(Events::default());
        let looper = Arc::new(Looper::new("egress-test"));
        manager.register_notification_handler(Arc::downgrade(&(events.clone() as Arc<dyn EgressNotification>)), looper.clone());
        (manager, events, looper)
    }

    #[tokio::test]
    async fn test_successful_allocation() {
        let (manager, events, _looper) = manager_with(|request| {
            // The request body carries the client key material.
            let body: serde_json::Value = serde_json::from_str(&request.json_body).unwrap();
            assert!(body["ppn"]["client_public_value"].is_string());
            Ok(HttpResponse {
                status_code: 200,
                status_message: "OK".into(),
                body: egress_body(),
            })
        });

        let params = PpnDataplaneRequestParams {
            client_public_value: "cHVi".into(),
            client_nonce: "bm9uY2U=".into(),
            ..PpnDataplaneRequestParams::default()
        };
        manager.get_egress_node_for_ppn_ipsec(params).unwrap();
        events.wait_for("available rekey=false").await;

        assert_eq!(manager.uplink_spi(), 123);
        let details = manager.get_egress_session_details().unwrap();
        assert_eq!(details.ppn_dataplane.egress_point_sock_addr.len(), 2);
    }

    #[tokio::test]
    async fn test_rekey_does_not_overwrite_spi() {
        let (manager, events, _looper) = manager_with(|_| {
            Ok(HttpResponse {
                status_code: 200,
                status_message: "OK".into(),
                body: egress_body(),
            })
        });

        manager
            .get_egress_node_for_ppn_ipsec(PpnDataplaneRequestParams::default())
            .unwrap();
        events.wait_for("available rekey=false").await;
        assert_eq!(manager.uplink_spi(), 123);

        let mut inner = manager.inner.lock().unwrap();
        inner.uplink_spi = 99; // pretend the saved SPI differs from the response
        drop(inner);

        manager
            .get_egress_node_for_ppn_ipsec(PpnDataplaneRequestParams {
                is_rekey: true,
                ..PpnDataplaneRequestParams::default()
            })
            .unwrap();
        events.wait_for("available rekey=true").await;
        assert_eq!(manager.uplink_spi(), 99);
    }

    #[tokio::test]
    async fn test_http_error_is_obfuscated() {
        let (manager, events, _looper) = manager_with(|_| {
            Ok(HttpResponse {
                status_code: 500,
                status_message: "Internal Server Error".into(),
                body: "sensitive".into(),
            })
        });

        manager
            .get_egress_node_for_ppn_ipsec(PpnDataplaneRequestParams::default())
            .unwrap();
        events.wait_for("unavailable Internal").await;

        let mut debug_info = EgressDebugInfo::default();
        manager.get_debug_info(&mut debug_info);
        assert_eq!(debug_info.state, "EgressSessionError");
        assert!(debug_info.status.contains("Content obfuscated"));
        assert!(!debug_info.status.contains("sensitive"));
    }

    #[tokio::test]
    async fn test_malformed_body_is_protocol_error() {
        let (manager, events, _looper) = manager_with(|_| {
            Ok(HttpResponse {
                status_code: 200,
                status_message: "OK".into(),
                body: r#"{"ppn_dataplane": {"uplink_spi": 0}}"#.into(),
            })
        });

        manager
            .get_egress_node_for_ppn_ipsec(PpnDataplaneRequestParams::default())
            .unwrap();
        events.wait_for("unavailable InvalidArgument").await;
        assert!(matches!(
            manager.get_egress_session_details(),
            Err(Status {
                code: Code::NotFound,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_stopped_manager_drops_response() {
        let (manager, events, _looper) = manager_with(|_| {
            std::thread::sleep(Duration::from_millis(30));
            Ok(HttpResponse {
                status_code: 200,
                status_message: "OK".into(),
                body: egress_body(),
            })
        });

        manager
            .get_egress_node_for_ppn_ipsec(PpnDataplaneRequestParams::default())
            .unwrap();
        manager.stop();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(events.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_latency_collection() {
        let (manager, events, _looper) = manager_with(|_| {
            Ok(HttpResponse {
                status_code: 200,
                status_message: "OK".into(),
                body: egress_body(),
            })
        });

        manager
            .get_egress_node_for_ppn_ipsec(PpnDataplaneRequestParams::default())
            .unwrap();
        events.wait_for("available rekey=false").await;

        let mut telemetry = KryptonTelemetry::default();
        manager.collect_telemetry(&mut telemetry);
        assert_eq!(telemetry.egress_latencies.len(), 1);
    }
}
