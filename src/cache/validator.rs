//! Conditional request state evaluated against stored entity tags.

use std::time::SystemTime;

use axum::http::{
    HeaderMap,
    header::{IF_MATCH, IF_MODIFIED_SINCE, IF_NONE_MATCH, IF_UNMODIFIED_SINCE},
};

/// Per-request conditional state.
///
/// Built once from the request headers, then re-evaluated for every candidate
/// entry examined during lookup. The outcome flags describe the last entry
/// evaluated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Revalidator {
    pub if_none_match: Option<Vec<String>>,
    pub if_match: Option<Vec<String>>,
    pub if_modified_since: Option<SystemTime>,
    pub if_unmodified_since: Option<SystemTime>,
    pub if_modified_since_present: bool,
    pub if_unmodified_since_present: bool,
    /// The entry satisfies the request's entity-tag condition.
    pub matched: bool,
    /// The origin has to confirm the entry before it can be replayed.
    pub need_revalidation: bool,
    /// A 304 may be answered directly from the cache.
    pub not_modified: bool,
    pub response_etag: Option<String>,
}

impl Revalidator {
    pub fn from_request(headers: &HeaderMap) -> Self {
        let if_modified_since_present = headers.contains_key(IF_MODIFIED_SINCE);
        let if_unmodified_since_present = headers.contains_key(IF_UNMODIFIED_SINCE);
        let if_none_match = entity_tags(headers, IF_NONE_MATCH);
        let not_modified = if_none_match.as_ref().is_some_and(|tags| !tags.is_empty());

        Self {
            if_none_match,
            if_match: entity_tags(headers, IF_MATCH),
            if_modified_since: http_date(headers, IF_MODIFIED_SINCE),
            if_unmodified_since: http_date(headers, IF_UNMODIFIED_SINCE),
            if_modified_since_present,
            if_unmodified_since_present,
            matched: false,
            need_revalidation: if_modified_since_present || if_unmodified_since_present,
            not_modified,
            response_etag: None,
        }
    }

    /// True when the client sent any entity-tag condition.
    pub fn sent_entity_tags(&self) -> bool {
        self.if_none_match.is_some() || self.if_match.is_some()
    }

    /// Evaluates the request conditions against a candidate entry's ETag.
    ///
    /// If-None-Match takes priority over If-Match; only one is honoured.
    pub fn evaluate(&mut self, etag: Option<&str>) {
        self.response_etag = etag.map(str::to_string);
        self.need_revalidation = self.if_modified_since_present || self.if_unmodified_since_present;

        match (etag, &self.if_none_match, &self.if_match) {
            (_, Some(tags), _) => {
                self.matched = match etag {
                    Some(etag) => tags.iter().any(|tag| tag == "*" || weak_eq(tag, etag)),
                    None => true,
                };
                self.not_modified = self.matched && etag.is_some();
                self.need_revalidation |= !self.not_modified;
            }
            (Some(etag), None, Some(tags)) => {
                self.matched = tags.iter().any(|tag| tag == "*" || tag == etag);
                self.not_modified = false;
                self.need_revalidation |= !self.matched;
            }
            (None, None, Some(_)) => {
                self.matched = false;
                self.not_modified = false;
                self.need_revalidation = true;
            }
            (_, None, None) => {
                self.matched = true;
                self.not_modified = false;
            }
        }
    }
}

fn entity_tags(headers: &HeaderMap, name: axum::http::HeaderName) -> Option<Vec<String>> {
    let mut present = false;
    let mut tags = Vec::new();
    for value in headers.get_all(name) {
        present = true;
        if let Ok(value) = value.to_str() {
            tags.extend(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|tag| !tag.is_empty())
                    .map(str::to_string),
            );
        }
    }
    present.then_some(tags)
}

fn http_date(headers: &HeaderMap, name: axum::http::HeaderName) -> Option<SystemTime> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| httpdate::parse_http_date(value).ok())
}

/// Weak comparison: `W/"a"` and `"a"` compare equal.
fn weak_eq(left: &str, right: &str) -> bool {
    left.trim_start_matches("W/") == right.trim_start_matches("W/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn request(pairs: &[(&'static str, &'static str)]) -> Revalidator {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.append(*name, HeaderValue::from_static(value));
        }
        Revalidator::from_request(&headers)
    }

    #[test]
    fn no_conditionals_always_match() {
        let mut validator = request(&[]);
        validator.evaluate(Some("\"v1\""));
        assert!(validator.matched);
        assert!(!validator.not_modified);
        assert!(!validator.need_revalidation);
    }

    #[test]
    fn if_none_match_equal_tag_is_not_modified() {
        let mut validator = request(&[("if-none-match", "\"v0\", \"v1\"")]);
        validator.evaluate(Some("\"v1\""));
        assert!(validator.matched);
        assert!(validator.not_modified);
        assert!(!validator.need_revalidation);
    }

    #[test]
    fn if_none_match_wildcard_and_weak_tags_match() {
        let mut validator = request(&[("if-none-match", "*")]);
        validator.evaluate(Some("\"v1\""));
        assert!(validator.not_modified);

        let mut validator = request(&[("if-none-match", "W/\"v1\"")]);
        validator.evaluate(Some("\"v1\""));
        assert!(validator.not_modified);
    }

    #[test]
    fn if_none_match_mismatch_requires_revalidation() {
        let mut validator = request(&[("if-none-match", "\"other\"")]);
        validator.evaluate(Some("\"v1\""));
        assert!(!validator.matched);
        assert!(!validator.not_modified);
        assert!(validator.need_revalidation);
    }

    #[test]
    fn entry_without_etag_matches_but_needs_origin_when_tags_sent() {
        let mut validator = request(&[("if-none-match", "\"v1\"")]);
        validator.evaluate(None);
        assert!(validator.matched);
        assert!(!validator.not_modified);
        assert!(validator.need_revalidation);
    }

    #[test]
    fn if_match_requires_entry_etag() {
        let mut validator = request(&[("if-match", "\"v1\"")]);
        validator.evaluate(None);
        assert!(!validator.matched);

        validator.evaluate(Some("\"v1\""));
        assert!(validator.matched);
        assert!(!validator.not_modified);

        validator.evaluate(Some("\"v2\""));
        assert!(!validator.matched);
        assert!(validator.need_revalidation);
    }

    #[test]
    fn if_none_match_takes_priority_over_if_match() {
        let mut validator = request(&[("if-none-match", "\"v1\""), ("if-match", "\"nope\"")]);
        validator.evaluate(Some("\"v1\""));
        assert!(validator.matched);
        assert!(validator.not_modified);
    }

    #[test]
    fn date_conditionals_force_revalidation() {
        let mut validator = request(&[("if-unmodified-since", "Tue, 15 Nov 1994 08:12:31 GMT")]);
        assert!(validator.if_unmodified_since_present);
        assert!(validator.if_unmodified_since.is_some());
        validator.evaluate(Some("\"v1\""));
        assert!(validator.need_revalidation);
    }
}
