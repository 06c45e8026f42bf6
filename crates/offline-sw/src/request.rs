//! Request and response model used by the cache and the fetcher.

use bytes::Bytes;
use hashbrown::HashMap;
use http::{Method, StatusCode};
use std::fmt;
use url::Url;

/// Request mode, as seen by the interceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level document load.
    Navigate,
    /// Same-origin sub-resource.
    #[default]
    SameOrigin,
    /// Cross-origin request without CORS; yields opaque responses.
    NoCors,
    /// Cross-origin request with CORS.
    Cors,
}

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct Request {
    pub url: Url,
    pub method: Method,
    pub mode: RequestMode,
    pub headers: HashMap<String, String>,
}

impl Request {
    /// Create a GET request for a sub-resource.
    pub fn get(url: Url) -> Self {
        Self {
            url,
            method: Method::GET,
            mode: RequestMode::SameOrigin,
            headers: HashMap::new(),
        }
    }

    /// Create a navigation request.
    pub fn navigate(url: Url) -> Self {
        Self {
            mode: RequestMode::Navigate,
            ..Self::get(url)
        }
    }

    /// Create a POST request.
    pub fn post(url: Url) -> Self {
        Self {
            method: Method::POST,
            ..Self::get(url)
        }
    }

    /// Set the request mode.
    pub fn with_mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Add a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Whether this is a top-level navigation.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    /// Cache identity of this request.
    pub fn key(&self) -> RequestKey {
        RequestKey::new(self.method.clone(), &self.url)
    }
}

/// Cache identity: two requests share an entry iff method and full URL match.
///
/// The fragment never reaches the server and is not part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub method: Method,
    pub url: String,
}

impl RequestKey {
    /// Build a key from a method and URL.
    pub fn new(method: Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method,
            url: url.into(),
        }
    }

    /// Key of a GET request.
    pub fn get(url: &Url) -> Self {
        Self::new(Method::GET, url)
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// Response classification, mirroring the fetch response types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseType {
    /// Same-origin response.
    #[default]
    Basic,
    /// Cross-origin response with CORS.
    Cors,
    /// Cross-origin no-cors response; status and body are hidden.
    Opaque,
    /// Network error.
    Error,
}

/// A response served to the page.
#[derive(Debug, Clone)]
pub struct Response {
    /// Final URL after redirects.
    pub url: Url,
    pub status: u16,
    pub status_text: String,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
    pub response_type: ResponseType,
    /// Whether a redirect was followed to produce this response.
    pub redirected: bool,
}

impl Response {
    /// Create a basic response.
    pub fn new(url: Url, status: u16, body: impl Into<Bytes>) -> Self {
        let status_text = StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("")
            .to_string();

        Self {
            url,
            status,
            status_text,
            headers: HashMap::new(),
            body: body.into(),
            response_type: ResponseType::Basic,
            redirected: false,
        }
    }

    /// Create a basic `200 OK` response.
    pub fn ok(url: Url, body: impl Into<Bytes>) -> Self {
        Self::new(url, 200, body)
    }

    /// Set the response type.
    pub fn with_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }

    /// Mark the response as the product of a redirect.
    pub fn with_redirected(mut self, redirected: bool) -> Self {
        self.redirected = redirected;
        self
    }

    /// Add a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Check if the status is 2xx.
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Only direct, same-origin `200` responses are stored.
    pub fn is_cacheable(&self) -> bool {
        self.status == 200 && self.response_type == ResponseType::Basic && !self.redirected
    }
}
