//! Cache configuration.
//!
//! Deserialized from the `[cache]` table of `cachet.toml` (or `CACHET__CACHE__*`
//! environment variables). Every field has a default so an empty table yields a
//! working cache.

use std::num::NonZeroUsize;
use std::time::Duration;

use axum::http::Method;
use serde::Deserialize;

// Default values for cache configuration
const DEFAULT_CACHE_NAME: &str = "Cachet";
const DEFAULT_TTL_SECS: u64 = 120;
const DEFAULT_STALE_SECS: u64 = 0;
const DEFAULT_BACKEND_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_STORAGE_TIMEOUT_MS: u64 = 100;
const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
const DEFAULT_MEMORY_CAPACITY: usize = 10_000;
const DEFAULT_API_BASE_PATH: &str = "/cachet-api/cachet";
const DEFAULT_ALLOWED_METHODS: [&str; 2] = ["GET", "HEAD"];

/// Cache configuration from `cachet.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Name reported in the `Cache-Status` header.
    pub cache_name: String,
    /// Which side's restrictions are honoured.
    pub mode: CacheMode,
    /// Static TTL used when a response carries no `max-age`/`s-maxage`.
    pub ttl_secs: u64,
    /// Extra lifetime of the stale shadow past the fresh TTL.
    pub stale_secs: u64,
    /// Cache-Control applied to responses that carry none.
    pub default_cache_control: Option<String>,
    /// Methods eligible for caching.
    pub allowed_methods: Vec<String>,
    /// Requests whose URI matches this pattern bypass the cache.
    pub exclude: Option<String>,
    /// Base cache-key flags.
    pub key: KeyFlags,
    /// Ordered key overrides; the first matching pattern wins.
    pub key_overrides: Vec<KeyOverride>,
    /// Ordered per-route TTL and default Cache-Control rules.
    pub routes: Vec<RouteRule>,
    /// Deadline for origin calls (upstream and revalidation).
    pub backend_timeout_ms: u64,
    /// Deadline for a single storage lookup.
    pub storage_timeout_ms: u64,
    /// Upper bound for buffered request and response bodies.
    pub max_body_bytes: usize,
    /// Maximum entries kept by the in-memory storer.
    pub memory_capacity: usize,
    pub api: ApiConfig,
    pub cdn: CdnConfig,
    /// Tags accepted by the surrogate index when `cdn.dynamic` is off.
    pub surrogate_keys: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_name: DEFAULT_CACHE_NAME.to_string(),
            mode: CacheMode::default(),
            ttl_secs: DEFAULT_TTL_SECS,
            stale_secs: DEFAULT_STALE_SECS,
            default_cache_control: None,
            allowed_methods: DEFAULT_ALLOWED_METHODS
                .iter()
                .map(|method| method.to_string())
                .collect(),
            exclude: None,
            key: KeyFlags::default(),
            key_overrides: Vec::new(),
            routes: Vec::new(),
            backend_timeout_ms: DEFAULT_BACKEND_TIMEOUT_MS,
            storage_timeout_ms: DEFAULT_STORAGE_TIMEOUT_MS,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            api: ApiConfig::default(),
            cdn: CdnConfig::default(),
            surrogate_keys: Vec::new(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn stale(&self) -> Duration {
        Duration::from_secs(self.stale_secs)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_millis(self.storage_timeout_ms)
    }

    /// Returns the memory capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn memory_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.memory_capacity).unwrap_or(NonZeroUsize::MIN)
    }

    /// Parsed allowed methods; unparsable entries are skipped.
    pub fn allowed_methods(&self) -> Vec<Method> {
        self.allowed_methods
            .iter()
            .filter_map(|method| Method::from_bytes(method.trim().to_uppercase().as_bytes()).ok())
            .collect()
    }

    /// True when the allowed methods differ from plain GET/HEAD, which turns on
    /// request body inspection for mutation detection.
    pub fn has_custom_methods(&self) -> bool {
        let mut configured: Vec<String> = self
            .allowed_methods
            .iter()
            .map(|method| method.trim().to_uppercase())
            .collect();
        configured.sort();
        configured.dedup();
        configured != DEFAULT_ALLOWED_METHODS.map(str::to_string)
    }
}

/// Which side's cache restrictions apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    #[default]
    Strict,
    Bypass,
    BypassRequest,
    BypassResponse,
}

impl CacheMode {
    /// Request Cache-Control is ignored (including its parse errors).
    pub fn bypasses_request(self) -> bool {
        matches!(self, Self::Bypass | Self::BypassRequest)
    }

    /// Response-side private/no-store restrictions are ignored.
    pub fn bypasses_response(self) -> bool {
        matches!(self, Self::Bypass | Self::BypassResponse)
    }

    pub fn is_strict(self) -> bool {
        self == Self::Strict
    }
}

/// Components contributing to the cache key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct KeyFlags {
    pub disable_body: bool,
    pub disable_host: bool,
    pub disable_method: bool,
    pub disable_query: bool,
    pub disable_scheme: bool,
    /// Replace the key with its SHA-256 digest.
    pub hash: bool,
    /// Redact the key from `Cache-Status` and admin listings.
    pub hide: bool,
    /// Request headers whose values are appended to the key.
    pub headers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KeyOverride {
    /// Regular expression matched against the request URI.
    pub pattern: String,
    #[serde(default)]
    pub key: KeyFlags,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RouteRule {
    /// Regular expression matched against the request URI.
    pub pattern: String,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    #[serde(default)]
    pub default_cache_control: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub base_path: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_path: DEFAULT_API_BASE_PATH.to_string(),
        }
    }
}

/// CDN in front of the cache, used for surrogate-key semantics and purges.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CdnConfig {
    pub provider: CdnProvider,
    /// Any tag may be created; when off only `surrogate_keys` are accepted.
    pub dynamic: bool,
    pub strategy: PurgeStrategy,
    pub api_key: Option<String>,
    pub email: Option<String>,
    pub hostname: Option<String>,
    pub network: Option<String>,
    pub service_id: Option<String>,
    pub zone_id: Option<String>,
    /// Replaces the provider's management API base URL.
    pub api_url: Option<String>,
}

impl Default for CdnConfig {
    fn default() -> Self {
        Self {
            provider: CdnProvider::default(),
            dynamic: true,
            strategy: PurgeStrategy::default(),
            api_key: None,
            email: None,
            hostname: None,
            network: None,
            service_id: None,
            zone_id: None,
            api_url: None,
        }
    }
}

impl CdnConfig {
    /// Soft purges keep the stale shadow of purged keys.
    pub fn keep_stale(&self) -> bool {
        self.strategy == PurgeStrategy::Soft
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CdnProvider {
    #[default]
    Generic,
    Fastly,
    Akamai,
    Cloudflare,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurgeStrategy {
    #[default]
    Soft,
    Hard,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.cache_name, "Cachet");
        assert_eq!(config.mode, CacheMode::Strict);
        assert_eq!(config.ttl(), Duration::from_secs(120));
        assert_eq!(config.stale(), Duration::ZERO);
        assert_eq!(config.allowed_methods(), vec![Method::GET, Method::HEAD]);
        assert!(!config.has_custom_methods());
        assert!(config.api.enabled);
        assert_eq!(config.api.base_path, "/cachet-api/cachet");
        assert!(config.cdn.dynamic);
        assert!(config.cdn.keep_stale());
    }

    #[test]
    fn memory_capacity_non_zero_clamps() {
        let config = CacheConfig {
            memory_capacity: 0,
            ..Default::default()
        };
        assert_eq!(config.memory_capacity_non_zero().get(), 1);
    }

    #[test]
    fn custom_methods_ignore_order_and_case() {
        let config = CacheConfig {
            allowed_methods: vec!["head".into(), "get".into()],
            ..Default::default()
        };
        assert!(!config.has_custom_methods());

        let config = CacheConfig {
            allowed_methods: vec!["GET".into(), "HEAD".into(), "POST".into()],
            ..Default::default()
        };
        assert!(config.has_custom_methods());
        assert_eq!(config.allowed_methods().len(), 3);
    }

    #[test]
    fn modes_expose_bypass_sides() {
        assert!(CacheMode::Bypass.bypasses_request());
        assert!(CacheMode::Bypass.bypasses_response());
        assert!(CacheMode::BypassRequest.bypasses_request());
        assert!(!CacheMode::BypassRequest.bypasses_response());
        assert!(!CacheMode::Strict.bypasses_request());
        assert!(CacheMode::Strict.is_strict());
    }

    #[test]
    fn deserializes_nested_tables() {
        let raw = serde_json::json!({
            "mode": "bypass_response",
            "key_overrides": [
                { "pattern": "^/api/", "key": { "disable_query": true, "headers": ["X-Tenant"] } }
            ],
            "cdn": { "provider": "fastly", "strategy": "hard", "service_id": "svc" }
        });
        let config: CacheConfig = serde_json::from_value(raw).expect("valid config");
        assert_eq!(config.mode, CacheMode::BypassResponse);
        assert_eq!(config.key_overrides[0].key.headers, vec!["X-Tenant"]);
        assert_eq!(config.cdn.provider, CdnProvider::Fastly);
        assert!(!config.cdn.keep_stale());
        assert_eq!(config.ttl_secs, 120);
    }
}
