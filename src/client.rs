//! Transport clients bound to an egress route, and the pool they are reused from.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::{HeaderMap, StatusCode};
use log::{debug, warn};
use parking_lot::Mutex;

use crate::config::TransportConfig;
use crate::error::{ProxyError, RequestError};
use crate::proxy::Egress;

/// Idle handles kept per route.
const MAX_IDLE_HANDLES_PER_ROUTE: usize = 2;

/// A GET request as handed to a transport.
#[derive(Debug, Clone)]
pub struct GetRequest {
    pub url: String,
    pub headers: HeaderMap,
    pub timeout: Duration,
}

impl GetRequest {
    /// A bare GET with no extra headers.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            headers: HeaderMap::new(),
            timeout,
        }
    }
}

/// What came back. `body` is `None` when the caller asked not to read it.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: StatusCode,
    pub body: Option<Vec<u8>>,
}

/// Something that can send GET requests along one route.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, request: &GetRequest, read_body: bool) -> Result<Reply, RequestError>;
}

/// A reusable transport handle.
pub type ClientHandle = Arc<dyn Transport>;

/// Builds transports for a route. One call is one dial attempt.
pub trait Connector: Send + Sync {
    fn connect(&self, egress: &Egress) -> Result<ClientHandle, ProxyError>;
}

/// `reqwest` based transport.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, request: &GetRequest, read_body: bool) -> Result<Reply, RequestError> {
        let response = self
            .client
            .get(&request.url)
            .headers(request.headers.clone())
            .timeout(request.timeout)
            .send()
            .await?;
        let status = response.status();
        if !read_body {
            return Ok(Reply { status, body: None });
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| RequestError::Read(e.to_string()))?;
        Ok(Reply {
            status,
            body: Some(body.to_vec()),
        })
    }
}

/// Connector that builds `reqwest` clients with the configured tuning.
pub struct ReqwestConnector {
    config: TransportConfig,
}

impl ReqwestConnector {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

impl Connector for ReqwestConnector {
    fn connect(&self, egress: &Egress) -> Result<ClientHandle, ProxyError> {
        // reqwest has no separate TLS handshake deadline; the connect timeout covers it
        let mut builder = reqwest::Client::builder()
            .timeout(self.config.request_timeout)
            .connect_timeout(self.config.tls_handshake_timeout)
            .pool_idle_timeout(self.config.idle_timeout)
            .pool_max_idle_per_host(self.config.max_idle_connections);
        if self.config.force_http2 {
            builder = builder.http2_prior_knowledge();
        }
        builder = match egress {
            Egress::Direct => builder.no_proxy(),
            Egress::Proxy(proxy) => builder.proxy(proxy.to_reqwest_proxy()?),
        };

        let client = builder.build().map_err(|e| ProxyError::Dial {
            proxy: egress.key().to_string(),
            attempts: 1,
            reason: e.to_string(),
        })?;
        Ok(Arc::new(ReqwestTransport { client }))
    }
}

/// Hands out transport handles, reusing idle ones built for the same route.
///
/// Handles are pooled per route key, so a lane never inherits a client that
/// dials through some other proxy.
pub struct ClientProvider {
    connector: Arc<dyn Connector>,
    retry_count: usize,
    idle: Mutex<HashMap<String, Vec<ClientHandle>>>,
}

impl ClientProvider {
    /// Create a new provider making up to `retry_count` dial attempts per build.
    pub fn new(connector: Arc<dyn Connector>, retry_count: usize) -> Self {
        Self {
            connector,
            retry_count: retry_count.max(1),
            idle: Mutex::new(HashMap::new()),
        }
    }

    /// Get a handle for `egress`, building one if none is idle.
    ///
    /// A freshly built handle is also stashed for the next caller on the same route.
    pub fn acquire(&self, egress: &Egress) -> Result<ClientHandle, ProxyError> {
        if let Some(handle) = self.idle.lock().get_mut(egress.key()).and_then(Vec::pop) {
            debug!("Reusing pooled client for {}", egress);
            return Ok(handle);
        }

        let handle = self.build(egress)?;
        self.release(egress, Arc::clone(&handle));
        Ok(handle)
    }

    /// Return a handle for reuse on the same route.
    pub fn release(&self, egress: &Egress, handle: ClientHandle) {
        let mut idle = self.idle.lock();
        let handles = idle.entry(egress.key().to_string()).or_default();
        if handles.len() < MAX_IDLE_HANDLES_PER_ROUTE {
            handles.push(handle);
        }
    }

    /// Drop every idle handle built for `egress`.
    pub fn forget(&self, egress: &Egress) {
        self.idle.lock().remove(egress.key());
    }

    /// Number of idle handles kept for `egress`.
    pub fn idle_count(&self, egress: &Egress) -> usize {
        self.idle.lock().get(egress.key()).map_or(0, Vec::len)
    }

    fn build(&self, egress: &Egress) -> Result<ClientHandle, ProxyError> {
        let mut last_reason = String::new();
        for attempt in 1..=self.retry_count {
            match self.connector.connect(egress) {
                Ok(handle) => return Ok(handle),
                // parse errors are final
                Err(err @ ProxyError::Parse { .. }) => return Err(err),
                Err(err) => {
                    warn!(
                        target: "proxies",
                        "Dial attempt {}/{} for {} failed: {}",
                        attempt, self.retry_count, egress, err
                    );
                    last_reason = err.to_string();
                }
            }
        }
        Err(ProxyError::Dial {
            proxy: egress.key().to_string(),
            attempts: self.retry_count,
            reason: last_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::Proxy;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Tagged(String);

    #[async_trait]
    impl Transport for Tagged {
        async fn get(&self, _: &GetRequest, _: bool) -> Result<Reply, RequestError> {
            Ok(Reply {
                status: StatusCode::OK,
                body: Some(self.0.clone().into_bytes()),
            })
        }
    }

    /// Fails the first `failures` dials, then builds a transport tagged with the route.
    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
    }

    impl Connector for Flaky {
        fn connect(&self, egress: &Egress) -> Result<ClientHandle, ProxyError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Egress::Proxy(proxy) = egress {
                proxy.parse()?;
            }
            if call < self.failures {
                return Err(ProxyError::Dial {
                    proxy: egress.key().to_string(),
                    attempts: 1,
                    reason: "connection refused".into(),
                });
            }
            Ok(Arc::new(Tagged(egress.key().to_string())))
        }
    }

    fn provider(failures: usize, retries: usize) -> (Arc<Flaky>, ClientProvider) {
        let connector = Arc::new(Flaky {
            failures,
            calls: AtomicUsize::new(0),
        });
        let provider = ClientProvider::new(connector.clone(), retries);
        (connector, provider)
    }

    async fn tag(handle: &ClientHandle) -> String {
        let reply = handle
            .get(&GetRequest::new("http://x", Duration::from_secs(1)), true)
            .await
            .unwrap();
        String::from_utf8(reply.body.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn retries_until_a_dial_succeeds() {
        let (connector, provider) = provider(2, 3);
        let egress = Egress::Proxy(Proxy::new("1.1.1.1:1080"));
        assert!(provider.acquire(&egress).is_ok());
        assert_eq!(connector.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn gives_up_after_retry_count() {
        let (connector, provider) = provider(usize::MAX, 3);
        let egress = Egress::Proxy(Proxy::new("1.1.1.1:1080"));
        match provider.acquire(&egress) {
            Err(ProxyError::Dial { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected dial error, got {:?}", other.err()),
        }
        assert_eq!(connector.calls.load(Ordering::SeqCst), 3);
        assert_eq!(provider.idle_count(&egress), 0);
    }

    #[test]
    fn malformed_address_is_not_retried() {
        let (connector, provider) = provider(0, 3);
        let egress = Egress::Proxy(Proxy::new("1.1.1.1:port"));
        assert!(matches!(
            provider.acquire(&egress),
            Err(ProxyError::Parse { .. })
        ));
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pooled_handles_stay_on_their_route() {
        let (connector, provider) = provider(0, 1);
        let a = Egress::Proxy(Proxy::new("1.1.1.1:1080"));
        let b = Egress::Proxy(Proxy::new("2.2.2.2:1080"));

        let first = provider.acquire(&a).unwrap();
        assert_eq!(provider.idle_count(&a), 1);

        // b must get its own client even though a has one idle
        let other = provider.acquire(&b).unwrap();
        assert_eq!(tag(&other).await, "2.2.2.2:1080");
        assert_eq!(connector.calls.load(Ordering::SeqCst), 2);

        let reused = provider.acquire(&a).unwrap();
        assert_eq!(tag(&reused).await, "1.1.1.1:1080");
        assert!(Arc::ptr_eq(&first, &reused));
        assert_eq!(connector.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn forget_drops_idle_handles() {
        let (_, provider) = provider(0, 1);
        let egress = Egress::Proxy(Proxy::new("1.1.1.1:1080"));
        provider.acquire(&egress).unwrap();
        provider.forget(&egress);
        assert_eq!(provider.idle_count(&egress), 0);
    }

    #[test]
    fn idle_list_is_capped() {
        let (_, provider) = provider(0, 1);
        let egress = Egress::Direct;
        let handle = provider.acquire(&egress).unwrap();
        for _ in 0..5 {
            provider.release(&egress, Arc::clone(&handle));
        }
        assert_eq!(provider.idle_count(&egress), MAX_IDLE_HANDLES_PER_ROUTE);
    }

    #[test]
    fn reqwest_connector_builds_direct_and_proxied_clients() {
        let connector = ReqwestConnector::new(TransportConfig::default());
        assert!(connector.connect(&Egress::Direct).is_ok());
        assert!(connector
            .connect(&Egress::Proxy(Proxy::new("user:pw@127.0.0.1:1080")))
            .is_ok());
        assert!(matches!(
            connector.connect(&Egress::Proxy(Proxy::new("127.0.0.1:nope"))),
            Err(ProxyError::Parse { .. })
        ));
    }
}
