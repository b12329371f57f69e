//! Administrative endpoints served under `api.base_path`.

use axum::{
    Json,
    body::Body,
    http::{Method, Request, StatusCode},
    response::{IntoResponse, Response},
};
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use url::Url;

use super::orchestrator::HttpCache;
use super::status::STORED_HIDDEN;

const FLUSH: &str = "flush";
const SURROGATE_KEYS: &str = "surrogate_keys";
/// Stand-in listed for keys derived with `hide`.
const REDACTED_KEY: &str = "<hidden>";

/// Body accepted by `POST <base>`.
#[derive(Debug, Deserialize)]
struct Invalidation {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    selectors: Vec<String>,
    #[serde(default)]
    groups: Vec<String>,
}

pub(super) fn is_internal(base: &str, path: &str) -> bool {
    path.strip_prefix(base)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

pub(super) async fn handle(cache: &HttpCache, request: Request<Body>) -> Response {
    let path = request.uri().path();
    let rest = path
        .strip_prefix(cache.api_base())
        .unwrap_or_default()
        .trim_start_matches('/')
        .to_string();
    let method = request.method().clone();

    match (method, rest.as_str()) {
        (Method::GET, "") => Json(listed_keys(cache, None).await).into_response(),
        (Method::GET, SURROGATE_KEYS) => Json(cache.surrogate().list()).into_response(),
        (Method::GET, pattern) => filter_keys(cache, pattern).await,
        (method, "") if method.as_str() == "PURGE" => {
            let (keys, tags) = cache.surrogate().purge(request.headers());
            info!(tags = ?tags, evicted = keys.len(), "purged by surrogate tags");
            cache.evict(&keys).await;
            StatusCode::NO_CONTENT.into_response()
        }
        (method, FLUSH) if method.as_str() == "PURGE" => {
            cache.flush().await;
            info!("flushed every storer");
            StatusCode::NO_CONTENT.into_response()
        }
        (method, pattern) if method.as_str() == "PURGE" => match Regex::new(pattern) {
            Ok(regex) => {
                let removed = cache.storage().delete_many(&regex).await;
                info!(pattern, removed, "purged by key pattern");
                StatusCode::NO_CONTENT.into_response()
            }
            Err(err) => bad_request(&err.to_string()),
        },
        (Method::POST, "") => invalidate(cache, request).await,
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

/// Stored keys matching `pattern`, with hidden ones redacted.
async fn listed_keys(cache: &HttpCache, pattern: Option<&Regex>) -> Vec<String> {
    let mut listed = Vec::new();
    for key in cache.storage().list_keys().await {
        if pattern.is_some_and(|pattern| !pattern.is_match(&key)) {
            continue;
        }
        let hidden = cache
            .storage()
            .entry(&key)
            .await
            .is_some_and(|entry| entry.headers.contains_key(STORED_HIDDEN));
        listed.push(if hidden { REDACTED_KEY.to_string() } else { key });
    }
    listed
}

async fn filter_keys(cache: &HttpCache, pattern: &str) -> Response {
    let regex = match Regex::new(pattern) {
        Ok(regex) => regex,
        Err(err) => return bad_request(&err.to_string()),
    };
    let keys = listed_keys(cache, Some(&regex)).await;
    if keys.is_empty() {
        return StatusCode::NOT_FOUND.into_response();
    }
    Json(keys).into_response()
}

async fn invalidate(cache: &HttpCache, request: Request<Body>) -> Response {
    let limit = cache.config().max_body_bytes;
    let body = match axum::body::to_bytes(request.into_body(), limit).await {
        Ok(body) => body,
        Err(err) => return bad_request(&err.to_string()),
    };
    let invalidation: Invalidation = match serde_json::from_slice(&body) {
        Ok(invalidation) => invalidation,
        Err(err) => return bad_request(&err.to_string()),
    };

    let patterns: Vec<String> = match invalidation.kind.as_str() {
        "uri" => invalidation
            .selectors
            .iter()
            .map(|selector| format!("-{}($|[-{{])", regex::escape(&uri_selector(selector))))
            .collect(),
        "uri-prefix" => invalidation
            .selectors
            .iter()
            .map(|selector| format!("-{}", regex::escape(&uri_selector(selector))))
            .collect(),
        "origin" => invalidation
            .selectors
            .iter()
            .map(|selector| format!("-{}-", regex::escape(&origin_selector(selector))))
            .collect(),
        "group" => {
            let keys = cache.surrogate().purge_tags(&invalidation.groups);
            info!(groups = ?invalidation.groups, evicted = keys.len(), "group invalidation");
            cache.evict(&keys).await;
            return StatusCode::NO_CONTENT.into_response();
        }
        other => return bad_request(&format!("unknown invalidation type `{other}`")),
    };

    for pattern in patterns {
        match Regex::new(&pattern) {
            Ok(regex) => {
                let removed = cache.storage().delete_many(&regex).await;
                info!(kind = %invalidation.kind, pattern, removed, "invalidated");
            }
            Err(err) => warn!(pattern, error = %err, "skipping invalid selector"),
        }
    }
    StatusCode::NO_CONTENT.into_response()
}

/// `https://example.com/a?b` → `example.com-/a?b`; bare paths pass through.
fn uri_selector(selector: &str) -> String {
    match Url::parse(selector) {
        Ok(url) if url.has_host() => {
            let mut target = format!("{}-{}", host_port(&url), url.path());
            if let Some(query) = url.query() {
                target.push('?');
                target.push_str(query);
            }
            target
        }
        _ => selector.to_string(),
    }
}

fn origin_selector(selector: &str) -> String {
    match Url::parse(selector) {
        Ok(url) if url.has_host() => host_port(&url),
        _ => selector.to_string(),
    }
}

fn host_port(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}
