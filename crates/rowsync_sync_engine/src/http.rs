//! HTTP transport.
//!
//! The actual HTTP client is abstracted via a trait so the web client can
//! run over reqwest, or be routed straight into a server in the same process
//! for tests.

use crate::config::WebClientConfig;
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use rowsync_sync_protocol::Message;
use std::sync::Arc;
use std::time::Duration;

/// HTTP client abstraction.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a POST request and returns the response body.
    ///
    /// Failures must be classified: network errors and server faults are
    /// retryable, rejected requests are not.
    async fn post(&self, url: &str, body: Vec<u8>) -> SyncResult<Vec<u8>>;

    /// Checks if the client is healthy.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// [`HttpClient`] over reqwest.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    /// Creates a client with a per-request timeout.
    pub fn new(timeout: Duration) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::http_permanent(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Wraps an existing reqwest client.
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn map_reqwest_error(error: reqwest::Error) -> SyncError {
    if error.is_timeout() {
        SyncError::TimedOut
    } else {
        SyncError::http_transient(error.to_string())
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn post(&self, url: &str, body: Vec<u8>) -> SyncResult<Vec<u8>> {
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/cbor")
            .body(body)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(map_reqwest_error)?;

        if status.is_success() {
            Ok(bytes.to_vec())
        } else if status.is_client_error() {
            Err(SyncError::http_permanent(format!(
                "{status}: {}",
                String::from_utf8_lossy(&bytes)
            )))
        } else {
            Err(SyncError::ServerFailed(format!(
                "{status}: {}",
                String::from_utf8_lossy(&bytes)
            )))
        }
    }
}

/// CBOR request/response exchange with retry and timeout.
pub struct HttpTransport<C: HttpClient> {
    config: WebClientConfig,
    client: C,
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a new HTTP transport.
    pub fn new(config: WebClientConfig, client: C) -> Self {
        Self {
            config,
            client,
            last_error: RwLock::new(None),
        }
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Returns true if the underlying client is healthy.
    pub fn is_healthy(&self) -> bool {
        self.client.is_healthy()
    }

    /// Posts `request` to `endpoint` and decodes the answer.
    ///
    /// Retryable failures are retried with backoff up to the configured
    /// attempt count; each attempt is bounded by the request timeout.
    pub async fn post_message<Req, Res>(&self, endpoint: &str, request: &Req) -> SyncResult<Res>
    where
        Req: Message + Sync,
        Res: Message,
    {
        let body = request
            .encode()
            .map_err(|e| SyncError::BadMessage(format!("failed to encode request: {e}")))?;
        let url = format!("{}{}", self.config.base_url, endpoint);
        let retry = &self.config.retry;
        let attempts = retry.attempts.max(1);

        let mut attempt = 0;
        loop {
            let delay = retry.backoff(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let result = match tokio::time::timeout(self.config.timeout, self.client.post(&url, body.clone())).await {
                Ok(result) => result,
                Err(_) => Err(SyncError::TimedOut),
            };

            match result {
                Ok(bytes) => {
                    *self.last_error.write() = None;
                    return Res::decode(&bytes)
                        .map_err(|e| SyncError::BadMessage(format!("failed to decode response: {e}")));
                }
                Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                    tracing::warn!(endpoint, attempt, error = %e, "request failed, retrying");
                    attempt += 1;
                }
                Err(e) => {
                    *self.last_error.write() = Some(e.to_string());
                    return Err(e);
                }
            }
        }
    }
}

impl<C: HttpClient> std::fmt::Debug for HttpTransport<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.config.base_url)
            .field("last_error", &self.last_error())
            .finish()
    }
}

/// Trait for servers that can handle loopback requests.
#[async_trait]
pub trait LoopbackServer: Send + Sync {
    /// Handles a POST request on `path` and returns the response body.
    async fn handle_post(&self, path: &str, body: &[u8]) -> SyncResult<Vec<u8>>;
}

#[async_trait]
impl<S: LoopbackServer + ?Sized> LoopbackServer for Arc<S> {
    async fn handle_post(&self, path: &str, body: &[u8]) -> SyncResult<Vec<u8>> {
        (**self).handle_post(path, body).await
    }
}

/// A loopback HTTP client that routes requests directly to a server.
///
/// Useful for testing without actual network overhead.
#[derive(Debug)]
pub struct LoopbackClient<S> {
    server: S,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self { server }
    }
}

#[async_trait]
impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    async fn post(&self, url: &str, body: Vec<u8>) -> SyncResult<Vec<u8>> {
        let path = url.find("/sync/").map(|i| &url[i..]).unwrap_or(url);
        self.server.handle_post(path, &body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use rowsync_sync_protocol::{EndSessionRequest, EndSessionResponse};
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    /// Fails with the given error a number of times, then echoes an
    /// end-session response.
    struct FlakyClient {
        failures: AtomicU32,
        retryable: bool,
        calls: AtomicU32,
    }

    impl FlakyClient {
        fn new(failures: u32, retryable: bool) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                retryable,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl HttpClient for FlakyClient {
        async fn post(&self, url: &str, body: Vec<u8>) -> SyncResult<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(url.ends_with("/sync/end-session"));
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(if self.retryable {
                    SyncError::http_transient("connection reset")
                } else {
                    SyncError::http_permanent("400 Bad Request")
                });
            }
            let request = EndSessionRequest::decode(&body).unwrap();
            Ok(EndSessionResponse {
                session_id: request.session_id,
            }
            .encode()
            .unwrap())
        }
    }

    fn config() -> WebClientConfig {
        WebClientConfig::new("http://sync.test/").with_retry(
            RetryPolicy::attempts(3)
                .with_first_delay(Duration::from_millis(1))
                .with_jitter(false),
        )
    }

    fn request() -> EndSessionRequest {
        EndSessionRequest {
            session_id: Uuid::new_v4(),
            scope_name: "default".into(),
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let transport = HttpTransport::new(config(), FlakyClient::new(2, true));
        let request = request();
        let response: EndSessionResponse = transport.post_message("/sync/end-session", &request).await.unwrap();
        assert_eq!(response.session_id, request.session_id);
        assert_eq!(transport.client.calls.load(Ordering::SeqCst), 3);
        assert!(transport.last_error().is_none());
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let transport = HttpTransport::new(config(), FlakyClient::new(5, true));
        let result: SyncResult<EndSessionResponse> = transport.post_message("/sync/end-session", &request()).await;
        assert!(matches!(result, Err(SyncError::Http { retryable: true, .. })));
        assert_eq!(transport.client.calls.load(Ordering::SeqCst), 3);
        assert!(transport.last_error().is_some());
    }

    #[tokio::test]
    async fn rejected_requests_are_not_retried() {
        let transport = HttpTransport::new(config(), FlakyClient::new(1, false));
        let result: SyncResult<EndSessionResponse> = transport.post_message("/sync/end-session", &request()).await;
        assert!(result.is_err());
        assert_eq!(transport.client.calls.load(Ordering::SeqCst), 1);
    }

    struct SlowClient;

    #[async_trait]
    impl HttpClient for SlowClient {
        async fn post(&self, _url: &str, _body: Vec<u8>) -> SyncResult<Vec<u8>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn slow_requests_time_out() {
        let config = WebClientConfig::new("http://sync.test")
            .with_timeout(Duration::from_millis(10))
            .with_retry(RetryPolicy::once());
        let transport = HttpTransport::new(config, SlowClient);
        let result: SyncResult<EndSessionResponse> = transport.post_message("/sync/end-session", &request()).await;
        assert!(matches!(result, Err(SyncError::TimedOut)));
    }

    struct Echo;

    #[async_trait]
    impl LoopbackServer for Echo {
        async fn handle_post(&self, path: &str, body: &[u8]) -> SyncResult<Vec<u8>> {
            let mut out = path.as_bytes().to_vec();
            out.extend_from_slice(body);
            Ok(out)
        }
    }

    #[tokio::test]
    async fn loopback_strips_the_base_url() {
        let client = LoopbackClient::new(Arc::new(Echo));
        let body = client.post("http://sync.test/api/sync/end-session", b"!".to_vec()).await.unwrap();
        assert_eq!(body, b"/sync/end-session!");
    }
}
