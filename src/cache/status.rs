//! `Cache-Status` annotations and replay age bookkeeping.

use std::fmt;
use std::time::{Duration, SystemTime};

use axum::http::{
    HeaderMap, HeaderName, HeaderValue,
    header::{AGE, DATE},
};

pub const CACHE_STATUS: HeaderName = HeaderName::from_static("cache-status");
/// TTL advertised when the entry was stored (seconds, before Date elapsed time).
pub const STORED_TTL: HeaderName = HeaderName::from_static("x-cachet-stored-ttl");
/// Body length recorded when the entry was stored.
pub const STORED_LENGTH: HeaderName = HeaderName::from_static("x-cachet-stored-length");
/// Present on entries whose key must not show up in diagnostics or listings.
pub const STORED_HIDDEN: HeaderName = HeaderName::from_static("x-cachet-hidden");

/// Builder for the `Cache-Status` diagnostic value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStatus(String);

impl CacheStatus {
    /// `<name>; fwd=<reason>`
    pub fn forward(name: &str, reason: &str) -> Self {
        Self(format!("{name}; fwd={reason}"))
    }

    /// `<name>; fwd=bypass; detail=<detail>`
    pub fn bypass(name: &str, detail: &str) -> Self {
        Self::forward(name, "bypass").detail(detail)
    }

    /// `<name>; hit; ttl=<ttl>; key=<key>; detail=<storer>`
    pub fn hit(name: &str, ttl: i64, key: &str, storer: &str) -> Self {
        Self(format!("{name}; hit; ttl={ttl}; key={key}; detail={storer}"))
    }

    pub fn key(self, key: &str) -> Self {
        self.param("key", key)
    }

    pub fn detail(self, detail: &str) -> Self {
        self.param("detail", detail)
    }

    pub fn param(mut self, name: &str, value: impl fmt::Display) -> Self {
        self.0.push_str(&format!("; {name}={value}"));
        self
    }

    pub fn stored(mut self) -> Self {
        self.0.push_str("; stored");
        self
    }

    pub fn stale(self) -> Self {
        self.param("fwd", "stale")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Writes the annotation, replacing any previous one.
    pub fn apply(&self, headers: &mut HeaderMap) {
        if let Ok(value) = HeaderValue::from_str(&self.0) {
            headers.insert(CACHE_STATUS, value);
        }
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Updates `Age` on a replayed entry and returns the remaining TTL in seconds
/// (negative once the entry is stale).
///
/// `Age` becomes the stored `Age` plus the apparent age derived from `Date`,
/// rounded up to whole seconds.
pub fn refresh_age(headers: &mut HeaderMap, now: SystemTime) -> i64 {
    let previous = headers
        .get(AGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(0);
    let apparent = header_time(headers, &DATE)
        .and_then(|date| now.duration_since(date).ok())
        .map(ceil_secs)
        .unwrap_or(0);
    let age = previous.saturating_add(apparent);
    headers.insert(AGE, HeaderValue::from(age));

    let stored_ttl = headers
        .get(&STORED_TTL)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<i64>().ok())
        .unwrap_or(0);
    stored_ttl.saturating_sub(i64::try_from(age).unwrap_or(i64::MAX))
}

/// Current `Age` header value in seconds.
pub fn age(headers: &HeaderMap) -> u64 {
    headers
        .get(AGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(0)
}

/// Removes the internal stored-metadata markers before delivery.
pub fn strip_internal(headers: &mut HeaderMap) {
    headers.remove(&STORED_TTL);
    headers.remove(&STORED_LENGTH);
    headers.remove(&STORED_HIDDEN);
}

pub fn header_time(headers: &HeaderMap, name: &HeaderName) -> Option<SystemTime> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| httpdate::parse_http_date(value).ok())
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 { secs + 1 } else { secs }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_annotations() {
        let miss = CacheStatus::forward("Cachet", "uri-miss")
            .key("GET-http-example.com-/x")
            .stored();
        assert_eq!(
            miss.as_str(),
            "Cachet; fwd=uri-miss; key=GET-http-example.com-/x; stored"
        );

        let hit = CacheStatus::hit("Cachet", 42, "k", "MEMORY").stale();
        assert_eq!(
            hit.as_str(),
            "Cachet; hit; ttl=42; key=k; detail=MEMORY; fwd=stale"
        );

        let bypass = CacheStatus::bypass("Cachet", "UNSUPPORTED-METHOD");
        assert_eq!(bypass.as_str(), "Cachet; fwd=bypass; detail=UNSUPPORTED-METHOD");
    }

    #[test]
    fn refresh_age_adds_apparent_age() {
        let now = SystemTime::now();
        let mut headers = HeaderMap::new();
        let date = httpdate::fmt_http_date(now - Duration::from_secs(10));
        headers.insert(DATE, HeaderValue::from_str(&date).expect("valid date"));
        headers.insert(AGE, HeaderValue::from_static("5"));
        headers.insert(STORED_TTL, HeaderValue::from_static("60"));

        let ttl = refresh_age(&mut headers, now);
        let age = age(&headers);
        assert!((15..=16).contains(&age), "age was {age}");
        assert_eq!(ttl, 60 - age as i64);
    }

    #[test]
    fn strip_internal_removes_markers() {
        let mut headers = HeaderMap::new();
        headers.insert(STORED_TTL, HeaderValue::from_static("60"));
        headers.insert(STORED_LENGTH, HeaderValue::from_static("3"));
        strip_internal(&mut headers);
        assert!(headers.is_empty());
    }
}
