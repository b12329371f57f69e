//! Surrogate tag index.
//!
//! Responses name the tags they belong to (`Surrogate-Key: product-1 listing`);
//! the index remembers which cache keys every tag covers so that purging one
//! tag evicts all of them. A parallel list per tag tracks the matching stale
//! shadows, which soft purges leave in place.
//!
//! Providers only differ in header conventions and in the purge calls sent to
//! the CDN in front of the cache. Those calls run on a detached task and their
//! failures are only logged.

mod akamai;
mod cloudflare;
mod fastly;
mod provider;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use axum::http::{HeaderMap, Method};
use tracing::{debug, warn};

pub use akamai::Akamai;
pub use cloudflare::Cloudflare;
pub use fastly::Fastly;
pub use provider::{Generic, PurgeRequest, SurrogateProvider, first_non_empty, split_tags};

use super::config::CacheConfig;
use super::error::BuildError;
use super::lock::mutex_lock;
use super::storer::stale_key;

const SOURCE: &str = "cache::surrogate";
const NO_STORE: &str = "no-store";
pub const GROUP_INVALIDATION: &str = "Cache-Group-Invalidation";

#[derive(Debug, Default)]
struct TagLists {
    fresh: HashMap<String, Vec<String>>,
    stale: HashMap<String, Vec<String>>,
}

pub struct SurrogateIndex {
    provider: Box<dyn SurrogateProvider>,
    lists: Mutex<TagLists>,
    dynamic: bool,
    declared: HashSet<String>,
    keep_stale: bool,
    client: reqwest::Client,
}

impl SurrogateIndex {
    pub fn new(config: &CacheConfig) -> Result<Self, BuildError> {
        Ok(Self {
            provider: provider::build(&config.cdn)?,
            lists: Mutex::new(TagLists::default()),
            dynamic: config.cdn.dynamic,
            declared: config.surrogate_keys.iter().cloned().collect(),
            keep_stale: config.cdn.keep_stale(),
            client: reqwest::Client::new(),
        })
    }

    pub fn provider(&self) -> &dyn SurrogateProvider {
        self.provider.as_ref()
    }

    /// Tags a response asks to be indexed under. Empty when the surrogate
    /// control forbids storing.
    pub fn tags(&self, headers: &HeaderMap) -> Vec<String> {
        if first_non_empty(headers, self.provider.control_headers())
            .is_some_and(|control| control.contains(NO_STORE))
        {
            return Vec::new();
        }
        first_non_empty(headers, self.provider.key_headers())
            .map(|value| split_tags(value, self.provider.separator()))
            .unwrap_or_default()
    }

    /// Applies the provider's header conventions to a delivered response.
    pub fn rewrite(&self, headers: &mut HeaderMap, tags: &[String]) {
        self.provider.rewrite(headers, tags);
    }

    /// Appends `cache_key` (and its stale shadow) to each accepted tag.
    /// Returns the tags that now cover the key.
    pub fn register(&self, tags: &[String], cache_key: &str) -> Vec<String> {
        let accepted: Vec<String> = tags
            .iter()
            .filter(|tag| self.dynamic || self.declared.contains(tag.as_str()))
            .cloned()
            .collect();
        if accepted.is_empty() {
            return accepted;
        }

        let shadow = stale_key(cache_key);
        let mut lists = mutex_lock(&self.lists, SOURCE, "register");
        for tag in &accepted {
            push_unique(lists.fresh.entry(tag.clone()).or_default(), cache_key);
            push_unique(lists.stale.entry(tag.clone()).or_default(), &shadow);
        }
        debug!(key = cache_key, tags = ?accepted, "indexed surrogate tags");
        accepted
    }

    /// Extracts tags from response headers and registers `cache_key`.
    pub fn store(&self, headers: &HeaderMap, cache_key: &str) -> Vec<String> {
        let tags = self.tags(headers);
        self.register(&tags, cache_key)
    }

    /// Purges the tags named by the request's surrogate header. Returns the
    /// cache keys to evict and the tags that were purged.
    pub fn purge(&self, request_headers: &HeaderMap) -> (Vec<String>, Vec<String>) {
        let tags = first_non_empty(request_headers, self.provider.key_headers())
            .map(|value| split_tags(value, self.provider.separator()))
            .unwrap_or_default();
        let keys = self.purge_tags(&tags);
        (keys, tags)
    }

    /// Removes `tags` from the index, notifies the CDN and returns the
    /// deduplicated cache keys they covered.
    pub fn purge_tags(&self, tags: &[String]) -> Vec<String> {
        if tags.is_empty() {
            return Vec::new();
        }

        let mut keys = Vec::new();
        {
            let mut lists = mutex_lock(&self.lists, SOURCE, "purge");
            for tag in tags {
                for key in lists.fresh.remove(tag).unwrap_or_default() {
                    push_unique(&mut keys, &key);
                }
                if !self.keep_stale {
                    for key in lists.stale.remove(tag).unwrap_or_default() {
                        push_unique(&mut keys, &key);
                    }
                }
            }
        }
        debug!(tags = ?tags, evicted = keys.len(), "purged surrogate tags");

        self.dispatch(self.provider.purge_requests(tags));
        keys
    }

    /// Group invalidation: unsafe methods may name tags to purge through
    /// `Cache-Group-Invalidation`.
    pub fn invalidate(&self, method: &Method, response_headers: &HeaderMap) -> Vec<String> {
        if is_safe(method) {
            return Vec::new();
        }
        let mut groups = Vec::new();
        for value in response_headers.get_all(GROUP_INVALIDATION) {
            if let Ok(value) = value.to_str() {
                for tag in split_tags(value, ",") {
                    if !groups.contains(&tag) {
                        groups.push(tag);
                    }
                }
            }
        }
        self.purge_tags(&groups)
    }

    /// Snapshot of tag → cache keys.
    pub fn list(&self) -> BTreeMap<String, Vec<String>> {
        mutex_lock(&self.lists, SOURCE, "list")
            .fresh
            .iter()
            .map(|(tag, keys)| (tag.clone(), keys.clone()))
            .collect()
    }

    pub fn reset(&self) {
        let mut lists = mutex_lock(&self.lists, SOURCE, "reset");
        lists.fresh.clear();
        lists.stale.clear();
    }

    fn dispatch(&self, requests: Vec<PurgeRequest>) {
        if requests.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                provider = self.provider.name(),
                "no async runtime available, skipping CDN purge"
            );
            return;
        };

        let client = self.client.clone();
        let provider = self.provider.name();
        runtime.spawn(async move {
            for request in requests {
                let mut builder = client.post(&request.url);
                for (name, value) in &request.headers {
                    builder = builder.header(*name, value.as_str());
                }
                if let Some(body) = &request.body {
                    builder = builder.json(body);
                }
                match builder.send().await {
                    Ok(response) if response.status().is_success() => {
                        debug!(provider, url = %request.url, "CDN purge accepted");
                    }
                    Ok(response) => {
                        warn!(provider, url = %request.url, status = %response.status(), "CDN purge rejected");
                    }
                    Err(err) => {
                        warn!(provider, url = %request.url, error = %err, "CDN purge failed");
                    }
                }
            }
        });
    }
}

fn push_unique(list: &mut Vec<String>, key: &str) {
    if !list.iter().any(|existing| existing == key) {
        list.push(key.to_string());
    }
}

fn is_safe(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
    )
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;
    use crate::cache::config::{CdnConfig, PurgeStrategy};

    fn index(config: CacheConfig) -> SurrogateIndex {
        SurrogateIndex::new(&config).expect("valid index")
    }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.append(*name, HeaderValue::from_static(value));
        }
        headers
    }

    #[test]
    fn store_then_purge_round_trip() {
        let index = index(CacheConfig::default());
        index.store(&headers(&[("surrogate-key", "A")]), "k1");
        assert_eq!(index.list().get("A"), Some(&vec!["k1".to_string()]));

        let (keys, tags) = index.purge(&headers(&[("surrogate-key", "A")]));
        assert_eq!(keys, vec!["k1".to_string()]);
        assert_eq!(tags, vec!["A".to_string()]);
        assert!(!index.list().contains_key("A"));
    }

    #[test]
    fn a_key_is_indexed_once_per_tag() {
        let index = index(CacheConfig::default());
        let response = headers(&[("surrogate-key", "A, B")]);
        index.store(&response, "k1");
        index.store(&response, "k1");
        index.store(&response, "k2");

        let list = index.list();
        assert_eq!(list["A"], vec!["k1".to_string(), "k2".to_string()]);
        assert_eq!(list["B"], vec!["k1".to_string(), "k2".to_string()]);
    }

    #[test]
    fn hard_purge_also_returns_stale_shadows() {
        let index = index(CacheConfig {
            cdn: CdnConfig {
                strategy: PurgeStrategy::Hard,
                ..Default::default()
            },
            ..Default::default()
        });
        index.store(&headers(&[("surrogate-key", "A")]), "k1");
        let (keys, _) = index.purge(&headers(&[("surrogate-key", "A")]));
        assert_eq!(keys, vec!["k1".to_string(), "STALE_k1".to_string()]);
    }

    #[test]
    fn surrogate_control_no_store_skips_indexing() {
        let index = index(CacheConfig::default());
        let stored = index.store(
            &headers(&[
                ("surrogate-key", "A"),
                ("surrogate-control", "max-age=60, no-store"),
            ]),
            "k1",
        );
        assert!(stored.is_empty());
        assert!(index.list().is_empty());
    }

    #[test]
    fn static_mode_only_accepts_declared_tags() {
        let index = index(CacheConfig {
            cdn: CdnConfig {
                dynamic: false,
                ..Default::default()
            },
            surrogate_keys: vec!["products".to_string()],
            ..Default::default()
        });
        let stored = index.store(&headers(&[("surrogate-key", "products, misc")]), "k1");
        assert_eq!(stored, vec!["products".to_string()]);
        assert!(!index.list().contains_key("misc"));
    }

    #[test]
    fn group_invalidation_only_on_unsafe_methods() {
        let index = index(CacheConfig::default());
        index.store(&headers(&[("surrogate-key", "A, B")]), "k1");
        let response = headers(&[("cache-group-invalidation", "A")]);

        assert!(index.invalidate(&Method::GET, &response).is_empty());
        assert_eq!(index.invalidate(&Method::POST, &response), vec!["k1".to_string()]);
        assert!(!index.list().contains_key("A"));
        assert!(index.list().contains_key("B"));
    }

    #[test]
    fn reset_clears_every_tag() {
        let index = index(CacheConfig::default());
        index.store(&headers(&[("edge-cache-tag", "A")]), "k1");
        index.reset();
        assert!(index.list().is_empty());
    }
}
