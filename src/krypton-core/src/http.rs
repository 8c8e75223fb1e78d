//! HTTP fetcher abstraction.
//!
//! The control plane only ever POSTs JSON bodies and resolves one hostname.
//! Both operations live behind [`HttpFetch`] so tests can substitute a fake
//! fetcher; the production implementation is a thin wrapper over a shared
//! `reqwest::Client`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::looper::Looper;
use crate::status::{Code, Status};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One outbound control-plane request.
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub url: String,
    pub json_body: String,
    pub headers: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn post_json(url: impl Into<String>, json_body: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            json_body: json_body.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// The response as seen by the control plane.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status_code: u16,
    pub status_message: String,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// Maps a non-2xx response to a [`Status`]. Bodies are logged verbatim
    /// unless an alternate message is supplied.
    pub fn error_status(&self, alternate_message: Option<String>) -> Status {
        let message = alternate_message.unwrap_or_else(|| self.status_message.clone());
        Status::from_http(self.status_code, message)
    }
}

/// Transport used by every control-plane component.
#[async_trait]
pub trait HttpFetch: Send + Sync {
    async fn post_json(&self, request: HttpRequest) -> Result<HttpResponse, Status>;

    /// Resolves a hostname to a single IP address string.
    async fn lookup_dns(&self, hostname: &str) -> Result<String, Status>;
}

/// Production fetcher over a shared reqwest client.
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("building HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpFetch for ReqwestFetcher {
    async fn post_json(&self, request: HttpRequest) -> Result<HttpResponse, Status> {
        let mut builder = self
            .client
            .post(&request.url)
            .header("Content-Type", "application/json")
            .body(request.json_body.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        let response = builder.send().await.map_err(|e| {
            let code = if e.is_timeout() {
                Code::DeadlineExceeded
            } else {
                Code::Unavailable
            };
            Status::new(code, format!("request to {} failed: {e}", request.url))
        })?;

        let status_code = response.status().as_u16();
        let status_message = response
            .status()
            .canonical_reason()
            .unwrap_or("")
            .to_string();
        let body = response
            .text()
            .await
            .map_err(|e| Status::unavailable(format!("reading response body: {e}")))?;
        Ok(HttpResponse {
            status_code,
            status_message,
            body,
        })
    }

    async fn lookup_dns(&self, hostname: &str) -> Result<String, Status> {
        let mut addrs = tokio::net::lookup_host((hostname, 0))
            .await
            .map_err(|e| Status::unavailable(format!("DNS lookup for {hostname} failed: {e}")))?;
        match addrs.next() {
            Some(addr) => Ok(addr.ip().to_string()),
            None => Err(Status::not_found(format!("no addresses for {hostname}"))),
        }
    }
}

/// Couples a fetcher with a component looper: responses are delivered as
/// posts, in-flight requests can be aborted wholesale on Stop.
pub struct AsyncHttpDispatcher {
    fetcher: Arc<dyn HttpFetch>,
    looper: Arc<Looper>,
    inflight: Mutex<Vec<JoinHandle<()>>>,
}

impl AsyncHttpDispatcher {
    pub fn new(fetcher: Arc<dyn HttpFetch>, looper: Arc<Looper>) -> Self {
        Self {
            fetcher,
            looper,
            inflight: Mutex::new(Vec::new()),
        }
    }

    pub fn fetcher(&self) -> &Arc<dyn HttpFetch> {
        &self.fetcher
    }

    /// Issues the request and posts `handler` onto the looper with the
    /// outcome.
    pub fn post_json_async(
        &self,
        request: HttpRequest,
        handler: impl FnOnce(Result<HttpResponse, Status>) + Send + 'static,
    ) {
        let fetcher = Arc::clone(&self.fetcher);
        let looper = Arc::clone(&self.looper);
        let url = request.url.clone();
        let handle = tokio::spawn(async move {
            debug!(%url, "dispatching control-plane request");
            let outcome = fetcher.post_json(request).await;
            if let Err(status) = &outcome {
                warn!(%url, %status, "control-plane request failed");
            }
            looper.post(move || handler(outcome));
        });
        let mut inflight = self.inflight.lock().unwrap();
        inflight.retain(|h| !h.is_finished());
        inflight.push(handle);
    }

    /// Aborts every in-flight request. Handlers for aborted requests never
    /// run.
    pub fn cancel_all(&self) {
        let mut inflight = self.inflight.lock().unwrap();
        for handle in inflight.drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticFetcher {
        status_code: u16,
        body: String,
    }

    #[async_trait]
    impl HttpFetch for StaticFetcher {
        async fn post_json(&self, _request: HttpRequest) -> Result<HttpResponse, Status> {
            Ok(HttpResponse {
                status_code: self.status_code,
                status_message: String::new(),
                body: self.body.clone(),
            })
        }

        async fn lookup_dns(&self, _hostname: &str) -> Result<String, Status> {
            Ok("192.0.2.1".to_string())
        }
    }

    #[test]
    fn test_request_builder() {
        let request = HttpRequest::post_json("https://example.com/x", "{}")
            .with_header("X-Goog-Api-Key", "key");
        assert_eq!(request.url, "https://example.com/x");
        assert_eq!(request.headers.len(), 1);
    }

    #[test]
    fn test_error_status_uses_alternate_message() {
        let response = HttpResponse {
            status_code: 403,
            status_message: "Forbidden".into(),
            body: "secret".into(),
        };
        let status = response.error_status(Some("content obfuscated".into()));
        assert_eq!(status.code, Code::PermissionDenied);
        assert_eq!(status.message, "content obfuscated");
    }

    #[tokio::test]
    async fn test_dispatcher_delivers_on_looper() {
        let looper = Arc::new(Looper::new("http-test"));
        let fetcher = Arc::new(StaticFetcher {
            status_code: 200,
            body: "{}".into(),
        });
        let dispatcher = AsyncHttpDispatcher::new(fetcher, looper.clone());

        let delivered = Arc::new(AtomicUsize::new(0));
        let d = delivered.clone();
        dispatcher.post_json_async(HttpRequest::post_json("https://x", "{}"), move |outcome| {
            assert_eq!(outcome.unwrap().status_code, 200);
            d.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lookup_dns_localhost() {
        let fetcher = ReqwestFetcher::new().unwrap();
        let ip = fetcher.lookup_dns("localhost").await.unwrap();
        assert!(ip == "127.0.0.1" || ip == "::1");
    }
}
