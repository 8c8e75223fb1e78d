//! Blind-signed authentication.
//!
//! One `start` drives one authentication round: fetch an OAuth token, pull
//! the bootstrap metadata and signing key from the initial-data endpoint
//! (when public metadata is enabled), blind a fresh token bound to the
//! metadata fingerprint, trade it at the zinc endpoint, and unblind the
//! returned signature. Exactly one of `auth_successful` / `auth_failure`
//! fires per round.

use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::{error, info, warn};

use crate::config::KryptonConfig;
use crate::http::{AsyncHttpDispatcher, HttpFetch, HttpRequest, HttpResponse};
use crate::looper::Looper;
use crate::messages::{
    AuthAndSignRequest, AuthAndSignResponse, GetInitialDataRequest, GetInitialDataResponse,
};
use crate::pal::OAuthProvider;
use crate::public_metadata::{self, DebugMode};
use crate::status::Status;
use crate::telemetry::{record_latency, AuthDebugInfo, KryptonTelemetry};
use krypton_crypto::{AuthCrypto, UnblindedToken};

/// Sink for the outcome of an authentication round.
pub trait AuthNotification: Send + Sync {
    fn auth_successful(&self, is_rekey: bool);
    fn auth_failure(&self, status: Status);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unauthenticated,
    Authenticated,
}

impl State {
    fn name(self) -> &'static str {
        match self {
            State::Unauthenticated => "Unauthenticated",
            State::Authenticated => "Authenticated",
        }
    }
}

struct AuthInner {
    state: State,
    stopped: bool,
    key_material: AuthCrypto,
    initial_data: Option<GetInitialDataResponse>,
    auth_response: Option<AuthAndSignResponse>,
    signed_token: Option<UnblindedToken>,
    latest_status: Option<Status>,
    notification: Option<(Weak<dyn AuthNotification>, Arc<Looper>)>,
    oauth_latencies: Vec<std::time::Duration>,
    initial_data_latencies: Vec<std::time::Duration>,
    zinc_latencies: Vec<std::time::Duration>,
    token_unblind_failure_count: u32,
}

/// Runs the authentication exchange against initial-data and zinc.
pub struct Auth {
    config: KryptonConfig,
    oauth: Arc<dyn OAuthProvider>,
    http: AsyncHttpDispatcher,
    inner: Mutex<AuthInner>,
}

impl Auth {
    pub fn new(
        config: KryptonConfig,
        fetcher: Arc<dyn HttpFetch>,
        oauth: Arc<dyn OAuthProvider>,
    ) -> Arc<Self> {
        let looper = Arc::new(Looper::new("auth"));
        Arc::new(Self {
            config,
            oauth,
            http: AsyncHttpDispatcher::new(fetcher, looper),
            inner: Mutex::new(AuthInner {
                state: State::Unauthenticated,
                stopped: false,
                key_material: AuthCrypto::new(),
                initial_data: None,
                auth_response: None,
                signed_token: None,
                latest_status: None,
                notification: None,
                oauth_latencies: Vec::new(),
                initial_data_latencies: Vec::new(),
                zinc_latencies: Vec::new(),
                token_unblind_failure_count: 0,
            }),
        })
    }

    /// Registers the sink; outcomes are posted onto `looper`.
    pub fn register_notification_handler(
        &self,
        handler: Weak<dyn AuthNotification>,
        looper: Arc<Looper>,
    ) {
        self.inner.lock().unwrap().notification = Some((handler, looper));
    }

    /// Begins one authentication round.
    pub fn start(self: &Arc<Self>, is_rekey: bool) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.key_material = AuthCrypto::new();
            inner.stopped = false;
        }
        if self.config.enable_blind_signing && self.config.public_metadata_enabled {
            info!(is_rekey, "starting authentication with blind signing");
            self.request_initial_data(is_rekey);
        } else {
            if self.config.enable_blind_signing {
                warn!("blind signing requires public metadata, authenticating without blinding");
            }
            info!(is_rekey, "starting authentication without blind signing");
            self.authenticate(is_rekey);
        }
    }

    /// Cancels the round in flight. Responses arriving afterwards are
    /// dropped.
    pub fn stop(&self) {
        self.inner.lock().unwrap().stopped = true;
        self.http.cancel_all();
    }

    fn request_initial_data(self: &Arc<Self>, is_rekey: bool) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let oauth_start = Instant::now();
            let token = match this.oauth.get_oauth_token().await {
                Ok(token) => token,
                Err(status) => {
                    error!(%status, "error fetching oauth token");
                    this.fail_locked(Status::internal("error fetching oauth token"));
                    return;
                }
            };
            {
                let mut inner = this.inner.lock().unwrap();
                record_latency(oauth_start, &mut inner.oauth_latencies, "oauth");
            }

            let request = GetInitialDataRequest {
                use_attestation: false,
                service_type: this.config.service_type.clone(),
                location_granularity: this.config.ip_geo_level,
                validation_version: 1,
            };
            let mut http_request =
                HttpRequest::post_json(this.config.initial_data_url.clone(), request.to_json())
                    .with_header("Authorization", format!("Bearer {token}"));
            if let Some(api_key) = &this.config.api_key {
                http_request = http_request.with_header("X-Goog-Api-Key", api_key.clone());
            }

            let request_start = Instant::now();
            let handler_this = Arc::clone(&this);
            this.http.post_json_async(http_request, move |outcome| {
                handler_this.handle_initial_data_response(is_rekey, token, request_start, outcome);
            });
        });
    }

    fn handle_initial_data_response(
        self: &Arc<Self>,
        is_rekey: bool,
        oauth_token: String,
        request_start: Instant,
        outcome: Result<HttpResponse, Status>,
    ) {
        let zinc_request = {
            let mut inner = self.inner.lock().unwrap();
            record_latency(request_start, &mut inner.initial_data_latencies, "initial_data");
            if inner.stopped {
                warn!("auth is already cancelled, ignoring initial data response");
                return;
            }

            let response = match outcome {
                Ok(response) => response,
                Err(status) => {
                    self.fail(&mut inner, status);
                    return;
                }
            };

            if response.status_code == 401 {
                self.oauth.clear_oauth_token(&oauth_token);
            }
            if !response.is_success() {
                error!(code = response.status_code, "initial data request failed");
                self.fail(&mut inner, response.error_status(None));
                return;
            }

            let initial_data = match GetInitialDataResponse::from_json(&response.body)
                .and_then(|r| r.verify_public_metadata(&self.config).map(|_| r))
            {
                Ok(initial_data) => initial_data,
                Err(status) => {
                    self.fail(&mut inner, status);
                    return;
                }
            };

            if let Err(e) = inner.key_material.set_blinding_public_key(
                &initial_data.at_public_metadata_public_key.serialized_public_key,
            ) {
                self.fail(&mut inner, Status::from(e));
                return;
            }

            let metadata = &initial_data.public_metadata_info.public_metadata;
            let fingerprint = public_metadata::fingerprint(metadata);
            let blinded = match inner
                .key_material
                .blind_token(Some(public_metadata::u64_to_be_bytes(fingerprint)))
            {
                Ok(blinded) => blinded,
                Err(e) => {
                    self.fail(&mut inner, Status::from(e));
                    return;
                }
            };

            let request = AuthAndSignRequest {
                oauth_token,
                service_type: metadata.service_type.clone(),
                blinded_tokens: vec![BASE64.encode(blinded)],
                key_version: Some(initial_data.at_public_metadata_public_key.key_version),
                public_metadata_info: Some(initial_data.public_metadata_info.clone()),
            };
            inner.initial_data = Some(initial_data);
            request
        };

        self.send_auth_and_sign(is_rekey, zinc_request);
    }

    fn authenticate(self: &Arc<Self>, is_rekey: bool) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let oauth_start = Instant::now();
            let token = match this.oauth.get_oauth_token().await {
                Ok(token) => token,
                Err(status) => {
                    error!(%status, "error fetching oauth token");
                    this.fail_locked(Status::internal("error fetching oauth token"));
                    return;
                }
            };
            {
                let mut inner = this.inner.lock().unwrap();
                record_latency(oauth_start, &mut inner.oauth_latencies, "oauth");
            }

            let request = AuthAndSignRequest {
                oauth_token: token,
                service_type: this.config.service_type.clone(),
                blinded_tokens: Vec::new(),
                key_version: None,
                public_metadata_info: None,
            };
            this.send_auth_and_sign(is_rekey, request);
        });
    }

    fn send_auth_and_sign(self: &Arc<Self>, is_rekey: bool, request: AuthAndSignRequest) {
        let mut http_request =
            HttpRequest::post_json(self.config.zinc_url.clone(), request.to_json());
        if let Some(api_key) = &self.config.api_key {
            http_request = http_request.with_header("X-Goog-Api-Key", api_key.clone());
        }
        let request_start = Instant::now();
        let handler_this = Arc::clone(self);
        self.http.post_json_async(http_request, move |outcome| {
            handler_this.handle_auth_and_sign_response(is_rekey, request_start, outcome);
        });
    }

    fn handle_auth_and_sign_response(
        self: &Arc<Self>,
        is_rekey: bool,
        request_start: Instant,
        outcome: Result<HttpResponse, Status>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        record_latency(request_start, &mut inner.zinc_latencies, "zinc");
        if inner.stopped {
            warn!("auth is already cancelled, ignoring auth response");
            return;
        }

        let response = match outcome {
            Ok(response) => response,
            Err(status) => {
                self.fail(&mut inner, status);
                return;
            }
        };
        info!(
            code = response.status_code,
            is_rekey, "got authentication response"
        );
        if !response.is_success() {
            self.fail(&mut inner, response.error_status(None));
            return;
        }

        let enforce_copper_suffix = inner
            .initial_data
            .as_ref()
            .map(|d| d.public_metadata_info.public_metadata.debug_mode != DebugMode::DebugAll)
            .unwrap_or(true);
        let auth_response =
            match AuthAndSignResponse::from_json(&response.body, &self.config, enforce_copper_suffix)
            {
                Ok(auth_response) => auth_response,
                Err(status) => {
                    error!("error decoding auth response");
                    self.fail(&mut inner, status);
                    return;
                }
            };

        if self.config.public_metadata_enabled {
            match Self::unblind_token(&inner.key_material, &auth_response) {
                Ok(token) => inner.signed_token = Some(token),
                Err(status) => {
                    error!(%status, "error unblinding token");
                    inner.token_unblind_failure_count += 1;
                    self.fail(&mut inner, status);
                    return;
                }
            }
        }
        inner.auth_response = Some(auth_response);

        self.set_state(&mut inner, State::Authenticated);
        if let Some((handler, looper)) = &inner.notification {
            let handler = handler.clone();
            looper.post(move || {
                if let Some(handler) = handler.upgrade() {
                    handler.auth_successful(is_rekey);
                }
            });
        }
    }

    fn unblind_token(
        key_material: &AuthCrypto,
        auth_response: &AuthAndSignResponse,
    ) -> Result<UnblindedToken, Status> {
        if auth_response.blinded_token_signature.len() != 1 {
            return Err(Status::internal(format!(
                "expected one blinded token signature, got {}",
                auth_response.blinded_token_signature.len()
            )));
        }
        let blind_signature = BASE64
            .decode(&auth_response.blinded_token_signature[0])
            .map_err(|_| Status::internal("failed to decode blinded token signature"))?;
        Ok(key_material.finalize_token(&blind_signature)?)
    }

    fn set_state(&self, inner: &mut AuthInner, state: State) {
        info!(
            from = inner.state.name(),
            to = state.name(),
            "auth state transition"
        );
        inner.state = state;
    }

    fn fail(&self, inner: &mut AuthInner, status: Status) {
        self.set_state(inner, State::Unauthenticated);
        inner.latest_status = Some(status.clone());
        if let Some((handler, looper)) = &inner.notification {
            let handler = handler.clone();
            looper.post(move || {
                if let Some(handler) = handler.upgrade() {
                    handler.auth_failure(status);
                }
            });
        }
    }

    fn fail_locked(&self, status: Status) {
        let mut inner = self.inner.lock().unwrap();
        if inner.stopped {
            return;
        }
        self.fail(&mut inner, status);
    }

    /// The parsed zinc response from the last successful round.
    pub fn auth_response(&self) -> AuthAndSignResponse {
        self.inner
            .lock()
            .unwrap()
            .auth_response
            .clone()
            .unwrap_or_default()
    }

    /// The parsed initial-data response from the last successful round.
    pub fn initial_data_response(&self) -> GetInitialDataResponse {
        self.inner
            .lock()
            .unwrap()
            .initial_data
            .clone()
            .unwrap_or_default()
    }

    /// The unblinded token produced by the last successful round.
    pub fn signed_token(&self) -> Option<UnblindedToken> {
        self.inner.lock().unwrap().signed_token.clone()
    }

    pub fn collect_telemetry(&self, telemetry: &mut KryptonTelemetry) {
        let mut inner = self.inner.lock().unwrap();
        telemetry.token_unblind_failure_count +=
            std::mem::take(&mut inner.token_unblind_failure_count);
        telemetry
            .oauth_latencies
            .append(&mut inner.oauth_latencies);
        telemetry
            .initial_data_latencies
            .append(&mut inner.initial_data_latencies);
        telemetry.zinc_latencies.append(&mut inner.zinc_latencies);
    }

    pub fn get_debug_info(&self, debug_info: &mut AuthDebugInfo) {
        let inner = self.inner.lock().unwrap();
        debug_info.state = inner.state.name().to_string();
        debug_info.status = inner
            .latest_status
            .as_ref()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "OK".to_string());
        debug_info.latencies = inner.zinc_latencies.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use blind_rsa_signatures::{KeyPair, Options};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FakeOAuth {
        cleared: AtomicUsize,
    }

    impl FakeOAuth {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                cleared: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl OAuthProvider for FakeOAuth {
        async fn get_oauth_token(&self) -> Result<String, Status> {
            Ok("oauth-token".to_string())
        }

        fn clear_oauth_token(&self, _token: &str) {
            self.cleared.fetch_add(1, Ordering::SeqCst);
        }
    }

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
        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }

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

    impl AuthNotification for Events {
        fn auth_successful(&self, is_rekey: bool) {
            self.push(format!("success rekey={is_rekey}"));
        }

        fn auth_failure(&self, status: Status) {
            self.push(format!(
                "failure {:?} permanent={}",
                status.code,
                status.is_permanent()
            ));
        }
    }

    fn config(public_metadata: bool) -> KryptonConfig {
        KryptonConfig {
            zinc_url: "https://auth.example.com/v1/authandsign".into(),
            brass_url: "https://egress.example.com/v1/addegress".into(),
            initial_data_url: "https://auth.example.com/v1/getinitialdata".into(),
            service_type: "service_type".into(),
            public_metadata_enabled: public_metadata,
            enable_blind_signing: public_metadata,
            ..KryptonConfig::default()
        }
    }

    fn ok(body: String) -> Result<HttpResponse, Status> {
        Ok(HttpResponse {
            status_code: 200,
            status_message: "OK".into(),
            body,
        })
    }

    fn http_error(code: u16) -> Result<HttpResponse, Status> {
        Ok(HttpResponse {
            status_code: code,
            status_message: "error".into(),
            body: String::new(),
        })
    }

    fn initial_data_body(pem: &str) -> String {
        serde_json::json!({
            "at_public_metadata_public_key": {
                "serialized_public_key": pem,
                "key_version": 2,
            },
            "public_metadata_info": {
                "public_metadata": {
                    "exit_location": {"country": "US"},
                    "service_type": "service_type",
                    "expiration": {"seconds": 900, "nanos": 0},
                },
                "validation_version": 1,
            },
        })
        .to_string()
    }

    /// Signs whatever blinded token the zinc request carries.
    fn scripted_backend(keypair: KeyPair) -> Arc<ScriptedFetcher> {
        let pem = keypair.pk.to_pem().unwrap();
        Arc::new(ScriptedFetcher {
            handler: Box::new(move |request| {
                if request.url.contains("getinitialdata") {
                    return ok(initial_data_body(&pem));
                }
                let body: serde_json::Value = serde_json::from_str(&request.json_body).unwrap();
                let blinded = BASE64
                    .decode(body["blinded_token"][0].as_str().unwrap())
                    .unwrap();
                let signature = keypair
                    .sk
                    .blind_sign(&mut rand::rngs::OsRng, blinded, &Options::default())
                    .unwrap();
                ok(serde_json::json!({
                    "blinded_token_signature": [BASE64.encode(&signature.0)],
                    "copper_controller_hostname": "us.b.example.com",
                    "apn_type": "ppn",
                })
                .to_string())
            }),
        })
    }

    #[tokio::test]
    async fn test_blind_signing_flow_succeeds() {
        let keypair = KeyPair::generate(&mut rand::rngs::OsRng, 2048).unwrap();
        let auth = Auth::new(config(true), scripted_backend(keypair), FakeOAuth::new());
        let events = Arc::new(Events::default());
        let looper = Arc::new(Looper::new("test-notify"));
        auth.register_notification_handler(
            Arc::downgrade(&(events.clone() as Arc<dyn AuthNotification>)),
            looper,
        );

        auth.start(false);
        events.wait_for("success rekey=false").await;

        let token = auth.signed_token().expect("token unblinded");
        assert!(token.plaintext_message.starts_with("blind:"));
        assert_eq!(
            auth.auth_response().copper_controller_hostname,
            "us.b.example.com"
        );
    }

    #[tokio::test]
    async fn test_plain_flow_without_blind_signing() {
        let fetcher = Arc::new(ScriptedFetcher {
            handler: Box::new(|request| {
                assert!(request.url.contains("authandsign"));
                ok(serde_json::json!({"apn_type": "ppn"}).to_string())
            }),
        });
        let auth = Auth::new(config(false), fetcher, FakeOAuth::new());
        let events = Arc::new(Events::default());
        let looper = Arc::new(Looper::new("test-notify"));
        auth.register_notification_handler(
            Arc::downgrade(&(events.clone() as Arc<dyn AuthNotification>)),
            looper,
        );

        auth.start(false);
        events.wait_for("success rekey=false").await;
        assert!(auth.signed_token().is_none());
    }

    #[tokio::test]
    async fn test_initial_data_401_clears_oauth_token() {
        let fetcher = Arc::new(ScriptedFetcher {
            handler: Box::new(|_| http_error(401)),
        });
        let oauth = FakeOAuth::new();
        let auth = Auth::new(config(true), fetcher, oauth.clone());
        let events = Arc::new(Events::default());
        let looper = Arc::new(Looper::new("test-notify"));
        auth.register_notification_handler(
            Arc::downgrade(&(events.clone() as Arc<dyn AuthNotification>)),
            looper,
        );

        auth.start(false);
        events.wait_for("failure Unauthenticated permanent=false").await;
        assert_eq!(oauth.cleared.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zinc_403_is_not_permanent() {
        let fetcher = Arc::new(ScriptedFetcher {
            handler: Box::new(|_| http_error(403)),
        });
        let auth = Auth::new(config(false), fetcher, FakeOAuth::new());
        let events = Arc::new(Events::default());
        let looper = Arc::new(Looper::new("test-notify"));
        auth.register_notification_handler(
            Arc::downgrade(&(events.clone() as Arc<dyn AuthNotification>)),
            looper,
        );

        auth.start(false);
        // An auth denial surfaces as a control-plane disconnect, not a
        // session-terminating failure.
        events.wait_for("failure PermissionDenied permanent=false").await;

        let mut debug_info = AuthDebugInfo::default();
        auth.get_debug_info(&mut debug_info);
        assert_eq!(debug_info.state, "Unauthenticated");
        assert!(debug_info.status.contains("PermissionDenied"));
    }

    #[tokio::test]
    async fn test_stopped_auth_drops_responses() {
        let fetcher = Arc::new(ScriptedFetcher {
            handler: Box::new(|_| {
                std::thread::sleep(Duration::from_millis(30));
                http_error(500)
            }),
        });
        let auth = Auth::new(config(false), fetcher, FakeOAuth::new());
        let events = Arc::new(Events::default());
        let looper = Arc::new(Looper::new("test-notify"));
        auth.register_notification_handler(
            Arc::downgrade(&(events.clone() as Arc<dyn AuthNotification>)),
            looper,
        );

        auth.start(false);
        auth.stop();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(events.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_telemetry_drains_counters() {
        let fetcher = Arc::new(ScriptedFetcher {
            handler: Box::new(|_| ok("{}".to_string())),
        });
        let auth = Auth::new(config(false), fetcher, FakeOAuth::new());
        let events = Arc::new(Events::default());
        let looper = Arc::new(Looper::new("test-notify"));
        auth.register_notification_handler(
            Arc::downgrade(&(events.clone() as Arc<dyn AuthNotification>)),
            looper,
        );

        auth.start(false);
        events.wait_for("success rekey=false").await;

        let mut telemetry = KryptonTelemetry::default();
        auth.collect_telemetry(&mut telemetry);
        assert_eq!(telemetry.zinc_latencies.len(), 1);
        assert_eq!(telemetry.oauth_latencies.len(), 1);

        let mut telemetry = KryptonTelemetry::default();
        auth.collect_telemetry(&mut telemetry);
        assert!(telemetry.zinc_latencies.is_empty());
    }
}
