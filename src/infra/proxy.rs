//! Reverse-proxy origin used by the standalone server.

use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{
        HeaderMap, HeaderName, Request,
        header::{
            CONNECTION, HOST, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE, TRAILER,
            TRANSFER_ENCODING, UPGRADE,
        },
    },
    response::Response,
};
use tracing::debug;
use url::Url;

use crate::cache::{Origin, OriginError};

use super::error::InfraError;

const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

const HOP_BY_HOP: [HeaderName; 8] = [
    CONNECTION,
    KEEP_ALIVE,
    PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION,
    TE,
    TRAILER,
    TRANSFER_ENCODING,
    UPGRADE,
];

/// Forwards requests to a fixed upstream base URL.
#[derive(Debug, Clone)]
pub struct ReverseProxy {
    client: reqwest::Client,
    upstream: Url,
    body_limit: usize,
}

impl ReverseProxy {
    pub fn new(mut upstream: Url, timeout: Duration, body_limit: usize) -> Result<Self, InfraError> {
        if !upstream.path().ends_with('/') {
            let path = format!("{}/", upstream.path());
            upstream.set_path(&path);
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|err| InfraError::upstream(err.to_string()))?;
        Ok(Self {
            client,
            upstream,
            body_limit,
        })
    }

    /// Upstream URL for a request path and query.
    pub fn target(&self, path_and_query: &str) -> Result<Url, OriginError> {
        self.upstream
            .join(path_and_query.trim_start_matches('/'))
            .map_err(|err| OriginError::Transport(format!("invalid upstream target: {err}")))
    }
}

#[async_trait]
impl Origin for ReverseProxy {
    async fn forward(self, request: Request<Body>) -> Result<Response, OriginError> {
        let (parts, body) = request.into_parts();
        let target = self.target(
            parts
                .uri
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/"),
        )?;
        let body = axum::body::to_bytes(body, self.body_limit)
            .await
            .map_err(|err| OriginError::Body(err.to_string()))?;

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        if let Some(host) = headers.remove(HOST) {
            headers.insert(X_FORWARDED_HOST, host);
        }

        debug!(method = %parts.method, target = %target, "forwarding upstream");
        let upstream = self
            .client
            .request(parts.method, target)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|err| OriginError::Transport(err.to_string()))?;

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        strip_hop_by_hop(&mut headers);
        let bytes = upstream
            .bytes()
            .await
            .map_err(|err| OriginError::Body(err.to_string()))?;

        let mut response = Response::new(Body::from(bytes));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in HOP_BY_HOP.iter().chain(listed.iter()) {
        headers.remove(name);
    }
}
