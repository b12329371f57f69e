//! Per-request state threaded through the orchestrator.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use axum::{
    body::Body,
    http::{HeaderMap, Method, Request, Uri, Version},
};
use bytes::Bytes;

use super::config::CacheMode;
use super::keys::DerivedKey;

/// Everything the orchestrator needs to know about the request being served.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub cache_name: Arc<str>,
    pub mode: CacheMode,
    /// Request arrival time; every freshness decision uses this instant.
    pub now: SystemTime,
    pub key: DerivedKey,
    /// Route static TTL.
    pub ttl: Duration,
    /// Stale shadow budget.
    pub stale: Duration,
    pub default_cache_control: Option<String>,
}

/// A buffered request that can be replayed towards the origin any number of
/// times (upstream fetch, background revalidation).
#[derive(Debug, Clone)]
pub struct RequestParts {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RequestParts {
    pub fn to_request(&self) -> Request<Body> {
        let mut request = Request::new(Body::from(self.body.clone()));
        *request.method_mut() = self.method.clone();
        *request.uri_mut() = self.uri.clone();
        *request.version_mut() = self.version;
        *request.headers_mut() = self.headers.clone();
        request
    }

    pub fn request_uri(&self) -> &str {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn replays_identical_requests() {
        let mut headers = HeaderMap::new();
        headers.insert("x-test", HeaderValue::from_static("1"));
        let parts = RequestParts {
            method: Method::POST,
            uri: "/graphql?op=1".parse().expect("uri"),
            version: Version::HTTP_11,
            headers,
            body: Bytes::from_static(b"{}"),
        };

        let first = parts.to_request();
        let second = parts.to_request();
        assert_eq!(first.method(), Method::POST);
        assert_eq!(first.uri(), second.uri());
        assert_eq!(first.headers().get("x-test").expect("header"), "1");
        assert_eq!(parts.request_uri(), "/graphql?op=1");
    }
}
