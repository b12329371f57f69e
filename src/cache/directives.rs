//! Cache-Control directive parsing for requests and responses.

use axum::http::{HeaderMap, header::CACHE_CONTROL};
use thiserror::Error;

/// Largest delta-seconds kept; bigger or overflowing values are clamped to
/// 2^31 (RFC 7234 section 1.2.1).
pub const MAX_DELTA_SECONDS: u64 = 2_147_483_648;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectiveError {
    #[error("directive `{directive}` expects delta-seconds, got `{value}`")]
    InvalidDeltaSeconds { directive: String, value: String },
    #[error("directive `{0}` requires a value")]
    MissingValue(String),
    #[error("unterminated quoted string in cache-control")]
    UnterminatedQuote,
    #[error("cache-control header is not valid ascii")]
    NotAscii,
}

/// `max-stale` may be sent without a bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxStale {
    Unbounded,
    Seconds(u64),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestDirectives {
    pub max_age: Option<u64>,
    pub max_stale: Option<MaxStale>,
    pub min_fresh: Option<u64>,
    pub no_cache: bool,
    pub no_store: bool,
    pub only_if_cached: bool,
    pub stale_if_error: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseDirectives {
    pub max_age: Option<u64>,
    pub s_maxage: Option<u64>,
    /// `Some(fields)` when present; an empty list is the bare directive.
    pub no_cache: Option<Vec<String>>,
    pub no_store: bool,
    pub private: Option<Vec<String>>,
    pub public: bool,
    pub must_revalidate: bool,
    pub proxy_revalidate: bool,
    pub stale_while_revalidate: Option<u64>,
    pub stale_if_error: Option<u64>,
}

impl RequestDirectives {
    pub fn parse(value: &str) -> Result<Self, DirectiveError> {
        let mut directives = Self::default();
        for (name, arg) in tokenize(value)? {
            match name.as_str() {
                "max-age" => directives.max_age = Some(required_seconds(&name, arg)?),
                "max-stale" => {
                    directives.max_stale = Some(match arg {
                        Some(value) => MaxStale::Seconds(delta_seconds(&name, &value)?),
                        None => MaxStale::Unbounded,
                    })
                }
                "min-fresh" => directives.min_fresh = Some(required_seconds(&name, arg)?),
                "no-cache" => directives.no_cache = true,
                "no-store" => directives.no_store = true,
                "only-if-cached" => directives.only_if_cached = true,
                "stale-if-error" => {
                    directives.stale_if_error = Some(required_seconds(&name, arg)?)
                }
                _ => {}
            }
        }
        Ok(directives)
    }

    pub fn from_headers(headers: &HeaderMap) -> Result<Self, DirectiveError> {
        Self::parse(&joined_cache_control(headers)?)
    }
}

impl ResponseDirectives {
    pub fn parse(value: &str) -> Result<Self, DirectiveError> {
        let mut directives = Self::default();
        for (name, arg) in tokenize(value)? {
            match name.as_str() {
                "max-age" => directives.max_age = Some(required_seconds(&name, arg)?),
                "s-maxage" => directives.s_maxage = Some(required_seconds(&name, arg)?),
                "no-cache" => directives.no_cache = Some(field_names(arg)),
                "no-store" => directives.no_store = true,
                "private" => directives.private = Some(field_names(arg)),
                "public" => directives.public = true,
                "must-revalidate" => directives.must_revalidate = true,
                "proxy-revalidate" => directives.proxy_revalidate = true,
                "stale-while-revalidate" => {
                    directives.stale_while_revalidate = Some(required_seconds(&name, arg)?)
                }
                "stale-if-error" => {
                    directives.stale_if_error = Some(required_seconds(&name, arg)?)
                }
                _ => {}
            }
        }
        Ok(directives)
    }

    pub fn from_headers(headers: &HeaderMap) -> Result<Self, DirectiveError> {
        Self::parse(&joined_cache_control(headers)?)
    }

    /// Bare `no-cache`: every replay must be revalidated.
    pub fn requires_revalidation(&self) -> bool {
        self.no_cache.as_ref().is_some_and(Vec::is_empty)
    }
}

/// Concatenates every `Cache-Control` header line into one directive list.
pub fn joined_cache_control(headers: &HeaderMap) -> Result<String, DirectiveError> {
    let mut values = Vec::new();
    for value in headers.get_all(CACHE_CONTROL) {
        values.push(value.to_str().map_err(|_| DirectiveError::NotAscii)?);
    }
    Ok(values.join(", "))
}

fn tokenize(value: &str) -> Result<Vec<(String, Option<String>)>, DirectiveError> {
    let mut tokens = Vec::new();
    for raw in split_outside_quotes(value)? {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let (name, arg) = match raw.split_once('=') {
            Some((name, arg)) => (name, Some(unquote(arg.trim()))),
            None => (raw, None),
        };
        tokens.push((name.trim().to_ascii_lowercase(), arg));
    }
    Ok(tokens)
}

fn split_outside_quotes(value: &str) -> Result<Vec<&str>, DirectiveError> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut escaped = false;
    let mut start = 0;
    for (idx, ch) in value.char_indices() {
        match ch {
            _ if escaped => escaped = false,
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&value[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    if in_quotes {
        return Err(DirectiveError::UnterminatedQuote);
    }
    parts.push(&value[start..]);
    Ok(parts)
}

fn unquote(value: &str) -> String {
    value
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(value)
        .replace("\\\"", "\"")
}

fn field_names(arg: Option<String>) -> Vec<String> {
    arg.map(|value| {
        value
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

fn required_seconds(name: &str, arg: Option<String>) -> Result<u64, DirectiveError> {
    match arg {
        Some(value) => delta_seconds(name, &value),
        None => Err(DirectiveError::MissingValue(name.to_string())),
    }
}

fn delta_seconds(name: &str, value: &str) -> Result<u64, DirectiveError> {
    if value.is_empty() || !value.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(DirectiveError::InvalidDeltaSeconds {
            directive: name.to_string(),
            value: value.to_string(),
        });
    }
    Ok(value
        .parse::<u64>()
        .map_or(MAX_DELTA_SECONDS, |secs| secs.min(MAX_DELTA_SECONDS)))
}
