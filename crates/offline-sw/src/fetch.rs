//! Network access for the background script.

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use reqwest::Client;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, trace};
use url::{Origin, Url};

use crate::request::{Request, RequestMode, Response, ResponseType};
use crate::ServiceWorkerError;

/// Performs requests on behalf of the cache manager.
///
/// `Err` means the request never produced a response (offline, DNS failure,
/// timeout). HTTP error statuses are `Ok` responses.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response, ServiceWorkerError>;
}

/// HTTP client configuration.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// User agent string.
    pub user_agent: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("offline-sw/{}", env!("CARGO_PKG_VERSION")),
            timeout: Duration::from_secs(30),
            max_redirects: 10,
        }
    }
}

/// [`Fetcher`] backed by reqwest.
pub struct HttpFetcher {
    client: Client,
    origin: Origin,
}

impl HttpFetcher {
    /// Create a fetcher for a worker running at `origin`.
    pub fn new(origin: &Url, config: FetcherConfig) -> Result<Self, ServiceWorkerError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| ServiceWorkerError::NetworkError(e.to_string()))?;

        info!(origin = %origin.origin().ascii_serialization(), "HttpFetcher initialized");

        Ok(Self {
            client,
            origin: origin.origin(),
        })
    }

    fn classify(&self, request: &Request, final_url: &Url) -> ResponseType {
        if final_url.origin() == self.origin {
            ResponseType::Basic
        } else if request.mode == RequestMode::NoCors {
            ResponseType::Opaque
        } else {
            ResponseType::Cors
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, ServiceWorkerError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone());
        for (name, value) in request.headers.iter() {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ServiceWorkerError::NetworkError(e.to_string()))?;

        let status = response.status();
        let final_url = response.url().clone();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let body = response
            .bytes()
            .await
            .map_err(|e| ServiceWorkerError::NetworkError(e.to_string()))?;

        let mut requested = request.url.clone();
        requested.set_fragment(None);
        let redirected = final_url != requested;
        let response_type = self.classify(request, &final_url);

        trace!(
            url = %final_url,
            status = %status,
            ?response_type,
            redirected,
            body_len = body.len(),
            "Response received"
        );

        if response_type == ResponseType::Opaque {
            return Ok(Response::new(final_url, 0, Bytes::new())
                .with_type(ResponseType::Opaque)
                .with_redirected(redirected));
        }

        let mut out = Response::new(final_url, status.as_u16(), body)
            .with_type(response_type)
            .with_redirected(redirected);
        out.headers = headers;
        Ok(out)
    }
}

// ==================== Static Fetcher ====================

/// In-memory origin server: answers from a route table and can be taken offline.
///
/// Unknown routes answer `404`. Every call is counted, online or not.
#[derive(Debug, Default)]
pub struct StaticFetcher {
    routes: RwLock<HashMap<String, Response>>,
    offline: AtomicBool,
    requests: AtomicUsize,
}

impl StaticFetcher {
    /// Create an online fetcher with no routes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `response` for `url`.
    pub async fn serve(&self, url: &Url, response: Response) {
        self.routes.write().await.insert(route_key(url), response);
    }

    /// Serve a basic `200 OK` with `body` for `url`.
    pub async fn serve_ok(&self, url: &Url, body: impl Into<Bytes>) {
        self.serve(url, Response::ok(url.clone(), body)).await;
    }

    /// Stop serving `url`; later requests get `404`.
    pub async fn remove(&self, url: &Url) {
        self.routes.write().await.remove(&route_key(url));
    }

    /// Simulate losing or regaining connectivity.
    pub fn set_online(&self, online: bool) {
        self.offline.store(!online, Ordering::SeqCst);
    }

    /// Number of fetches attempted so far.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

fn route_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.into()
}

#[async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, ServiceWorkerError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(ServiceWorkerError::NetworkError(format!(
                "offline: {}",
                request.url
            )));
        }

        let routes = self.routes.read().await;
        Ok(routes
            .get(&route_key(&request.url))
            .cloned()
            .unwrap_or_else(|| Response::new(request.url.clone(), 404, Bytes::new())))
    }
}
