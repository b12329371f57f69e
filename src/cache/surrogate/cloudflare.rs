use axum::http::{HeaderMap, HeaderValue};
use serde_json::json;

use super::provider::{CACHE_TAG, PurgeRequest, SURROGATE_KEY, SurrogateProvider, required};
use crate::cache::config::CdnConfig;
use crate::cache::error::BuildError;

const DEFAULT_API_URL: &str = "https://api.cloudflare.com/client/v4";
const KEY_HEADERS: [&str; 2] = [CACHE_TAG, SURROGATE_KEY];
/// Cloudflare accepts at most this many tags per purge call.
const TAGS_PER_CALL: usize = 30;

#[derive(Debug, Clone)]
pub struct Cloudflare {
    url: String,
    email: String,
    api_key: String,
}

impl Cloudflare {
    pub fn from_config(config: &CdnConfig) -> Result<Self, BuildError> {
        let base = config
            .api_url
            .as_deref()
            .unwrap_or(DEFAULT_API_URL)
            .trim_end_matches('/');
        let zone = required(&config.zone_id, "cloudflare", "zone_id")?;
        Ok(Self {
            url: format!("{base}/zones/{zone}/purge_cache"),
            email: required(&config.email, "cloudflare", "email")?.to_string(),
            api_key: required(&config.api_key, "cloudflare", "api_key")?.to_string(),
        })
    }
}

impl SurrogateProvider for Cloudflare {
    fn name(&self) -> &'static str {
        "cloudflare"
    }

    fn separator(&self) -> &'static str {
        ","
    }

    fn key_headers(&self) -> &[&'static str] {
        &KEY_HEADERS
    }

    fn rewrite(&self, headers: &mut HeaderMap, tags: &[String]) {
        if tags.is_empty() {
            return;
        }
        if let Ok(value) = HeaderValue::from_str(&tags.join(",")) {
            headers.insert("cache-tag", value);
        }
    }

    fn purge_requests(&self, tags: &[String]) -> Vec<PurgeRequest> {
        tags.chunks(TAGS_PER_CALL)
            .map(|batch| {
                PurgeRequest::post(self.url.as_str())
                    .header("X-Auth-Email", self.email.as_str())
                    .header("X-Auth-Key", self.api_key.as_str())
                    .json(json!({ "tags": batch }))
            })
            .collect()
    }
}
