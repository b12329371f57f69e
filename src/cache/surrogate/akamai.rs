use axum::http::{HeaderMap, HeaderValue};
use serde_json::json;

use super::provider::{PurgeRequest, SURROGATE_CONTROL, SURROGATE_KEY, SurrogateProvider, required};
use crate::cache::config::CdnConfig;
use crate::cache::error::BuildError;

/// Akamai Fast Purge (CCU v3) by tag.
#[derive(Debug, Clone)]
pub struct Akamai {
    url: String,
}

impl Akamai {
    pub fn from_config(config: &CdnConfig) -> Result<Self, BuildError> {
        let base = match config.api_url.as_deref() {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("https://{}", required(&config.hostname, "akamai", "hostname")?),
        };
        let action = if config.keep_stale() {
            "invalidate"
        } else {
            "delete"
        };
        let mut url = format!("{base}/ccu/v3/{action}/tag");
        if let Some(network) = config.network.as_deref().filter(|n| !n.is_empty()) {
            url.push('/');
            url.push_str(network);
        }
        Ok(Self { url })
    }
}

impl SurrogateProvider for Akamai {
    fn name(&self) -> &'static str {
        "akamai"
    }

    /// Tags move to `Edge-Cache-Tag`; surrogate headers are not forwarded.
    fn rewrite(&self, headers: &mut HeaderMap, tags: &[String]) {
        headers.remove(SURROGATE_KEY);
        headers.remove(SURROGATE_CONTROL);
        if tags.is_empty() {
            return;
        }
        if let Ok(value) = HeaderValue::from_str(&tags.join(", ")) {
            headers.insert("edge-cache-tag", value);
        }
    }

    fn purge_requests(&self, tags: &[String]) -> Vec<PurgeRequest> {
        if tags.is_empty() {
            return Vec::new();
        }
        vec![
            PurgeRequest::post(self.url.as_str())
                .header("Accept", "application/json")
                .json(json!({ "objects": tags })),
        ]
    }
}
