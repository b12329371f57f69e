//! Storage backend contract and the built-in in-memory backend.
//!
//! Backends only see opaque bytes under string keys. The multi-level pair
//! layers variant bookkeeping on top: for every base key a small index
//! (`IDX_<key>`) records which variant keys exist, the request header values
//! that select them, their ETag and their fresh/stale deadlines. Stale shadows
//! live under `STALE_<variant key>`.

use std::sync::RwLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use axum::http::HeaderMap;
use bytes::Bytes;
use lru::LruCache;
use metrics::counter;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::config::CacheConfig;
use super::error::StorageError;
use super::lock::{rw_read, rw_write};
use super::validator::Revalidator;
use super::vary::{self, VariedValues};

const SOURCE: &str = "cache::storer";
const METRIC_STORAGE_EVICT_TOTAL: &str = "cachet_storage_evict_total";

pub const STALE_PREFIX: &str = "STALE_";
pub const MAPPING_PREFIX: &str = "IDX_";

pub fn stale_key(key: &str) -> String {
    format!("{STALE_PREFIX}{key}")
}

pub fn mapping_key(key: &str) -> String {
    format!("{MAPPING_PREFIX}{key}")
}

/// True for keys holding real entries, as opposed to stale shadows or
/// variant indexes.
pub fn is_entry_key(key: &str) -> bool {
    !key.starts_with(STALE_PREFIX) && !key.starts_with(MAPPING_PREFIX)
}

/// Fresh and stale candidates found for one base key.
#[derive(Debug, Clone, Default)]
pub struct MultiLevel {
    pub fresh: Option<Bytes>,
    pub stale: Option<Bytes>,
    /// Variant key the candidates belong to.
    pub variant_key: Option<String>,
}

/// One variant write.
#[derive(Debug, Clone)]
pub struct VariantWrite<'a> {
    pub base_key: &'a str,
    pub variant_key: &'a str,
    pub value: Bytes,
    pub varied: &'a [(String, String)],
    pub etag: Option<&'a str>,
    pub ttl: Duration,
    pub stale: Duration,
    pub now: SystemTime,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct VariantIndex {
    variants: Vec<VariantRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VariantRecord {
    key: String,
    varied: VariedValues,
    etag: Option<String>,
    fresh_until: u64,
    stale_until: u64,
}

#[async_trait]
pub trait Storer: Send + Sync {
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError>;

    /// A zero `ttl` removes any existing value instead of storing.
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Deletes every key matching `pattern`; returns how many were removed.
    async fn delete_many(&self, pattern: &Regex) -> Result<usize, StorageError>;

    /// Entry keys, excluding stale shadows and variant indexes.
    async fn list_keys(&self) -> Result<Vec<String>, StorageError>;

    async fn reset(&self) -> Result<(), StorageError>;

    /// Selects the variant of `base_key` matching the request and returns its
    /// fresh and stale copies. The validator is evaluated against the
    /// selected variant's ETag.
    async fn get_multi_level(
        &self,
        base_key: &str,
        request_headers: &HeaderMap,
        validator: &mut Revalidator,
        now: SystemTime,
    ) -> Result<MultiLevel, StorageError> {
        let Some(raw) = self.get(&mapping_key(base_key)).await? else {
            return Ok(MultiLevel::default());
        };
        let index: VariantIndex = serde_json::from_slice(&raw)
            .map_err(|err| StorageError::corrupt(err.to_string()))?;
        let now = unix_secs(now);

        let Some(record) = index
            .variants
            .iter()
            .find(|record| vary::matches(&record.varied, request_headers))
        else {
            return Ok(MultiLevel::default());
        };
        validator.evaluate(record.etag.as_deref());

        let fresh = if now < record.fresh_until {
            self.get(&record.key).await?
        } else {
            None
        };
        let stale = if fresh.is_none() && now < record.stale_until {
            self.get(&stale_key(&record.key)).await?
        } else {
            None
        };
        Ok(MultiLevel {
            fresh,
            stale,
            variant_key: Some(record.key.clone()),
        })
    }

    /// Stores a variant, its stale shadow and updates the variant index.
    async fn set_multi_level(&self, write: VariantWrite<'_>) -> Result<(), StorageError> {
        self.set(write.variant_key, write.value.clone(), write.ttl)
            .await?;
        if !write.stale.is_zero() {
            self.set(
                &stale_key(write.variant_key),
                write.value,
                write.ttl.saturating_add(write.stale),
            )
            .await?;
        }

        let index_key = mapping_key(write.base_key);
        let mut index = match self.get(&index_key).await? {
            Some(raw) => serde_json::from_slice::<VariantIndex>(&raw).unwrap_or_default(),
            None => VariantIndex::default(),
        };
        let now = unix_secs(write.now);
        index
            .variants
            .retain(|record| record.key != write.variant_key && record.stale_until > now);
        index.variants.insert(
            0,
            VariantRecord {
                key: write.variant_key.to_string(),
                varied: write.varied.to_vec(),
                etag: write.etag.map(str::to_string),
                fresh_until: now.saturating_add(write.ttl.as_secs()),
                stale_until: now.saturating_add(write.ttl.saturating_add(write.stale).as_secs()),
            },
        );

        let horizon = index
            .variants
            .iter()
            .map(|record| record.stale_until)
            .max()
            .unwrap_or(now)
            .saturating_sub(now);
        let encoded =
            serde_json::to_vec(&index).map_err(|err| StorageError::corrupt(err.to_string()))?;
        self.set(&index_key, Bytes::from(encoded), Duration::from_secs(horizon))
            .await
    }
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

struct MemoryItem {
    value: Bytes,
    /// `None` when the ttl reaches past what `Instant` can represent.
    expires_at: Option<Instant>,
}

impl MemoryItem {
    fn live_at(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// LRU-bounded in-process storer with per-entry expiry.
pub struct MemoryStorer {
    entries: RwLock<LruCache<String, MemoryItem>>,
}

impl MemoryStorer {
    pub const NAME: &'static str = "MEMORY";

    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(config.memory_capacity_non_zero())),
        }
    }

    /// Number of stored values, including shadows and indexes.
    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Storer for MemoryStorer {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError> {
        let mut entries = rw_write(&self.entries, SOURCE, "get");
        let expired = match entries.get(key) {
            Some(item) if item.live_at(Instant::now()) => return Ok(Some(item.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StorageError> {
        let mut entries = rw_write(&self.entries, SOURCE, "set");
        if ttl.is_zero() {
            entries.pop(key);
            return Ok(());
        }
        let item = MemoryItem {
            value,
            expires_at: Instant::now().checked_add(ttl),
        };
        if let Some((evicted, _)) = entries.push(key.to_string(), item)
            && evicted != key
        {
            counter!(METRIC_STORAGE_EVICT_TOTAL, "storer" => Self::NAME).increment(1);
            warn!(storer = Self::NAME, evicted = %evicted, "evicted entry at capacity");
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        rw_write(&self.entries, SOURCE, "delete").pop(key);
        Ok(())
    }

    async fn delete_many(&self, pattern: &Regex) -> Result<usize, StorageError> {
        let mut entries = rw_write(&self.entries, SOURCE, "delete_many");
        let doomed: Vec<String> = entries
            .iter()
            .map(|(key, _)| key)
            .filter(|key| pattern.is_match(key))
            .cloned()
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        Ok(doomed.len())
    }

    async fn list_keys(&self) -> Result<Vec<String>, StorageError> {
        let now = Instant::now();
        let entries = rw_read(&self.entries, SOURCE, "list_keys");
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(key, item)| item.live_at(now) && is_entry_key(key))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn reset(&self) -> Result<(), StorageError> {
        rw_write(&self.entries, SOURCE, "reset").clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use axum::http::HeaderValue;

    use super::*;

    fn storer(capacity: usize) -> MemoryStorer {
        MemoryStorer::new(&CacheConfig {
            memory_capacity: capacity,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn memory_roundtrip_and_expiry() {
        let store = storer(16);
        store
            .set("k", Bytes::from_static(b"v"), Duration::from_millis(30))
            .await
            .expect("set");
        assert_eq!(store.get("k").await.expect("get"), Some(Bytes::from_static(b"v")));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.get("k").await.expect("get"), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn zero_ttl_removes_existing_value() {
        let store = storer(16);
        store
            .set("k", Bytes::from_static(b"v"), Duration::from_secs(5))
            .await
            .expect("set");
        store
            .set("k", Bytes::from_static(b"w"), Duration::ZERO)
            .await
            .expect("set");
        assert_eq!(store.get("k").await.expect("get"), None);
    }

    #[tokio::test]
    async fn unrepresentable_ttls_do_not_overflow() {
        let store = storer(16);
        store
            .set("k", Bytes::from_static(b"v"), Duration::MAX)
            .await
            .expect("set");
        assert_eq!(store.get("k").await.expect("get"), Some(Bytes::from_static(b"v")));
        assert_eq!(store.list_keys().await.expect("list"), vec!["k".to_string()]);

        let now = SystemTime::now();
        store
            .set_multi_level(VariantWrite {
                base_key: "GET-/huge",
                variant_key: "GET-/huge",
                value: Bytes::from_static(b"v"),
                varied: &[],
                etag: None,
                ttl: Duration::MAX,
                stale: Duration::from_secs(30),
                now,
            })
            .await
            .expect("set");
        let mut validator = Revalidator::default();
        let found = store
            .get_multi_level("GET-/huge", &HeaderMap::new(), &mut validator, now)
            .await
            .expect("lookup");
        assert_eq!(found.fresh, Some(Bytes::from_static(b"v")));
    }

    #[tokio::test]
    async fn lru_eviction_at_capacity() {
        let store = storer(2);
        for key in ["a", "b", "c"] {
            store
                .set(key, Bytes::from_static(b"v"), Duration::from_secs(5))
                .await
                .expect("set");
        }
        assert_eq!(store.get("a").await.expect("get"), None);
        assert!(store.get("c").await.expect("get").is_some());
    }

    #[tokio::test]
    async fn delete_many_and_list_keys_skip_internal_prefixes() {
        let store = storer(16);
        for key in ["GET-/a", "GET-/b", "STALE_GET-/a", "IDX_GET-/a"] {
            store
                .set(key, Bytes::from_static(b"v"), Duration::from_secs(5))
                .await
                .expect("set");
        }
        assert_eq!(
            store.list_keys().await.expect("list"),
            vec!["GET-/a".to_string(), "GET-/b".to_string()]
        );

        let removed = store
            .delete_many(&Regex::new("/a$").expect("regex"))
            .await
            .expect("delete");
        assert_eq!(removed, 3);
        assert_eq!(store.list_keys().await.expect("list"), vec!["GET-/b".to_string()]);
    }

    #[tokio::test]
    async fn multi_level_selects_matching_variant() {
        let store = storer(16);
        let now = SystemTime::now();
        let fr = vec![("Accept-Language".to_string(), "fr".to_string())];
        let de = vec![("Accept-Language".to_string(), "de".to_string())];
        for (varied, body) in [(&fr, "bonjour"), (&de, "hallo")] {
            let variant_key = format!("GET-/x{}", vary::key_suffix(varied));
            store
                .set_multi_level(VariantWrite {
                    base_key: "GET-/x",
                    variant_key: &variant_key,
                    value: Bytes::from(body),
                    varied,
                    etag: Some("\"v1\""),
                    ttl: Duration::from_secs(60),
                    stale: Duration::from_secs(60),
                    now,
                })
                .await
                .expect("set");
        }

        let mut request = HeaderMap::new();
        request.insert("accept-language", HeaderValue::from_static("fr"));
        let mut validator = Revalidator::from_request(&request);
        let found = store
            .get_multi_level("GET-/x", &request, &mut validator, now)
            .await
            .expect("lookup");
        assert_eq!(found.fresh, Some(Bytes::from_static(b"bonjour")));
        assert_eq!(validator.response_etag.as_deref(), Some("\"v1\""));

        request.insert("accept-language", HeaderValue::from_static("it"));
        let missing = store
            .get_multi_level("GET-/x", &request, &mut validator, now)
            .await
            .expect("lookup");
        assert!(missing.fresh.is_none() && missing.stale.is_none());
    }

    #[tokio::test]
    async fn multi_level_returns_stale_after_fresh_deadline() {
        let store = storer(16);
        let stored_at = SystemTime::now();
        store
            .set_multi_level(VariantWrite {
                base_key: "k",
                variant_key: "k",
                value: Bytes::from_static(b"v"),
                varied: &[],
                etag: None,
                ttl: Duration::from_secs(1),
                stale: Duration::from_secs(30),
                now: stored_at,
            })
            .await
            .expect("set");

        let later = stored_at + Duration::from_secs(2);
        let mut validator = Revalidator::default();
        let found = store
            .get_multi_level("k", &HeaderMap::new(), &mut validator, later)
            .await
            .expect("lookup");
        assert!(found.fresh.is_none());
        assert_eq!(found.stale, Some(Bytes::from_static(b"v")));
    }

    #[test]
    fn memory_storer_recovers_from_poisoned_lock() {
        let store = storer(4);
        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = store.entries.write().expect("entries lock should be acquired");
            panic!("poison entries lock");
        }));
        assert_eq!(store.len(), 0);
    }
}
