//! Provider capabilities: how tags are read from headers, how delivered
//! headers are rewritten and which CDN purge calls a purge triggers.

use axum::http::HeaderMap;
use serde_json::Value;

use super::akamai::Akamai;
use super::cloudflare::Cloudflare;
use super::fastly::Fastly;
use crate::cache::config::{CdnConfig, CdnProvider};
use crate::cache::error::BuildError;

pub const SURROGATE_KEY: &str = "Surrogate-Key";
pub const SURROGATE_CONTROL: &str = "Surrogate-Control";
pub const EDGE_CACHE_TAG: &str = "Edge-Cache-Tag";
pub const CACHE_TAG: &str = "Cache-Tag";

const GENERIC_KEY_HEADERS: [&str; 3] = [SURROGATE_KEY, EDGE_CACHE_TAG, "Cache-Tags"];
const GENERIC_CONTROL_HEADERS: [&str; 4] = [
    "Cachet-Cache-Control",
    SURROGATE_CONTROL,
    "CDN-Cache-Control",
    "Cache-Control",
];

/// An outbound call to a CDN management API. Always a POST.
#[derive(Debug, Clone, PartialEq)]
pub struct PurgeRequest {
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: Option<Value>,
}

impl PurgeRequest {
    pub fn post(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

pub trait SurrogateProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Separator between tags sharing one header value.
    fn separator(&self) -> &'static str {
        ", "
    }

    /// Headers carrying tags, in precedence order.
    fn key_headers(&self) -> &[&'static str] {
        &GENERIC_KEY_HEADERS
    }

    /// Headers carrying the surrogate control directive, in precedence order.
    fn control_headers(&self) -> &[&'static str] {
        &GENERIC_CONTROL_HEADERS
    }

    /// Adjusts delivered response headers once `tags` were extracted.
    fn rewrite(&self, _headers: &mut HeaderMap, _tags: &[String]) {}

    /// CDN calls issued after purging `tags` locally.
    fn purge_requests(&self, _tags: &[String]) -> Vec<PurgeRequest> {
        Vec::new()
    }
}

/// Plain surrogate-key support with no CDN behind the cache.
#[derive(Debug, Default, Clone, Copy)]
pub struct Generic;

impl SurrogateProvider for Generic {
    fn name(&self) -> &'static str {
        "generic"
    }
}

pub fn build(config: &CdnConfig) -> Result<Box<dyn SurrogateProvider>, BuildError> {
    Ok(match config.provider {
        CdnProvider::Generic => Box::new(Generic),
        CdnProvider::Fastly => Box::new(Fastly::from_config(config)?),
        CdnProvider::Akamai => Box::new(Akamai::from_config(config)?),
        CdnProvider::Cloudflare => Box::new(Cloudflare::from_config(config)?),
    })
}

pub(super) fn required<'a>(
    value: &'a Option<String>,
    provider: &str,
    field: &str,
) -> Result<&'a str, BuildError> {
    value
        .as_deref()
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| BuildError::Cdn(format!("{provider} requires `cdn.{field}`")))
}

/// Splits a header value into tags.
pub fn split_tags(value: &str, separator: &str) -> Vec<String> {
    let separator = separator.trim();
    let parts: Box<dyn Iterator<Item = &str>> = if separator.is_empty() {
        Box::new(value.split_whitespace())
    } else {
        Box::new(value.split(separator))
    };
    let mut tags: Vec<String> = Vec::new();
    for tag in parts.map(str::trim).filter(|tag| !tag.is_empty()) {
        if !tags.iter().any(|existing| existing == tag) {
            tags.push(tag.to_string());
        }
    }
    tags
}

/// Value of the first candidate header that is present and non-empty.
pub fn first_non_empty<'a>(headers: &'a HeaderMap, candidates: &[&str]) -> Option<&'a str> {
    candidates.iter().find_map(|name| {
        headers
            .get(*name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    })
}
