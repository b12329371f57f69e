//! Reads and writes spread over every configured storer.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use axum::http::HeaderMap;
use futures::future::join_all;
use metrics::counter;
use regex::Regex;
use tracing::warn;

use super::entry::ResponseSnapshot;
use super::error::StorageError;
use super::storer::{Storer, VariantWrite};
use super::validator::Revalidator;

const METRIC_STORE_FAILURE_TOTAL: &str = "cachet_store_failure_total";

/// Candidates found by the first storer that had any.
#[derive(Debug, Clone)]
pub struct Lookup {
    pub storer: String,
    pub fresh: Option<ResponseSnapshot>,
    pub stale: Option<ResponseSnapshot>,
}

/// Result of writing one response to every storer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreOutcome {
    /// At least one storer accepted the write.
    pub stored: bool,
    /// Names of the storers that rejected it.
    pub failed: Vec<String>,
}

impl StoreOutcome {
    /// `Cache-Status` details for the failed storers.
    pub fn details(&self) -> impl Iterator<Item = String> + '_ {
        self.failed
            .iter()
            .map(|name| format!("{name}-INSERTION-ERROR"))
    }
}

#[derive(Clone)]
pub struct StorageFanout {
    storers: Vec<Arc<dyn Storer>>,
    timeout: Duration,
}

impl StorageFanout {
    pub fn new(storers: Vec<Arc<dyn Storer>>, timeout: Duration) -> Self {
        Self { storers, timeout }
    }

    pub fn storers(&self) -> &[Arc<dyn Storer>] {
        &self.storers
    }

    /// Queries storers in order; the first returning a fresh or stale
    /// candidate wins. Failing or slow storers are skipped.
    pub async fn lookup(
        &self,
        base_key: &str,
        request_headers: &HeaderMap,
        validator: &mut Revalidator,
        now: SystemTime,
    ) -> Option<Lookup> {
        for storer in &self.storers {
            let found = match tokio::time::timeout(
                self.timeout,
                storer.get_multi_level(base_key, request_headers, validator, now),
            )
            .await
            {
                Ok(Ok(found)) => found,
                Ok(Err(err)) => {
                    warn!(storer = storer.name(), key = base_key, error = %err, "storage lookup failed");
                    continue;
                }
                Err(_) => {
                    warn!(
                        storer = storer.name(),
                        key = base_key,
                        error = %StorageError::Timeout(storer.name().to_string()),
                        "storage lookup failed"
                    );
                    continue;
                }
            };

            let fresh = decode(storer.name(), found.fresh.as_deref());
            let stale = decode(storer.name(), found.stale.as_deref());
            if fresh.is_some() || stale.is_some() {
                return Some(Lookup {
                    storer: storer.name().to_string(),
                    fresh,
                    stale,
                });
            }
        }
        None
    }

    /// Writes to every storer concurrently. One failure never cancels the
    /// other writes.
    pub async fn store(&self, write: VariantWrite<'_>) -> StoreOutcome {
        let writes = self.storers.iter().map(|storer| {
            let write = write.clone();
            async move { (storer.name().to_string(), storer.set_multi_level(write).await) }
        });

        let mut outcome = StoreOutcome::default();
        for (name, result) in join_all(writes).await {
            match result {
                Ok(()) => outcome.stored = true,
                Err(err) => {
                    counter!(METRIC_STORE_FAILURE_TOTAL, "storer" => name.clone()).increment(1);
                    warn!(storer = %name, key = write.variant_key, error = %err, "storage write failed");
                    outcome.failed.push(name);
                }
            }
        }
        outcome
    }

    pub async fn delete(&self, keys: &[String]) {
        for storer in &self.storers {
            for key in keys {
                if let Err(err) = storer.delete(key).await {
                    warn!(storer = storer.name(), key = %key, error = %err, "storage delete failed");
                }
            }
        }
    }

    /// The entry stored under `key` by the first storer holding one.
    pub async fn entry(&self, key: &str) -> Option<ResponseSnapshot> {
        for storer in &self.storers {
            match tokio::time::timeout(self.timeout, storer.get(key)).await {
                Ok(Ok(Some(raw))) => return decode(storer.name(), Some(&raw)),
                Ok(Ok(None)) => {}
                Ok(Err(err)) => warn!(storer = storer.name(), key, error = %err, "storage read failed"),
                Err(_) => warn!(
                    storer = storer.name(),
                    key,
                    error = %StorageError::Timeout(storer.name().to_string()),
                    "storage read failed"
                ),
            }
        }
        None
    }

    /// Deletes keys matching `pattern` in every storer; returns the total.
    pub async fn delete_many(&self, pattern: &Regex) -> usize {
        let mut removed = 0;
        for storer in &self.storers {
            match storer.delete_many(pattern).await {
                Ok(count) => removed += count,
                Err(err) => {
                    warn!(storer = storer.name(), pattern = %pattern, error = %err, "storage bulk delete failed")
                }
            }
        }
        removed
    }

    /// Union of every storer's entry keys, sorted and deduplicated.
    pub async fn list_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        for storer in &self.storers {
            match storer.list_keys().await {
                Ok(found) => keys.extend(found),
                Err(err) => warn!(storer = storer.name(), error = %err, "storage listing failed"),
            }
        }
        keys.sort();
        keys.dedup();
        keys
    }

    pub async fn reset(&self) {
        for storer in &self.storers {
            if let Err(err) = storer.reset().await {
                warn!(storer = storer.name(), error = %err, "storage reset failed");
            }
        }
    }
}

fn decode(storer: &str, raw: Option<&[u8]>) -> Option<ResponseSnapshot> {
    let raw = raw?;
    match ResponseSnapshot::decode(raw) {
        Ok(snapshot) => Some(snapshot),
        Err(err) => {
            warn!(storer, error = %err, "discarding undecodable entry");
            None
        }
    }
}
