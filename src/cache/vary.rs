//! `Vary` handling: variant selection and deterministic key suffixes.

use axum::http::{HeaderMap, header::VARY};
use url::form_urlencoded::byte_serialize;

pub const VARY_SEPARATOR: &str = "{-VARY-}";
const HEADER_SEPARATOR: &str = ";";

/// Request header values a stored variant was selected by.
pub type VariedValues = Vec<(String, String)>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Vary {
    None,
    Wildcard,
    Headers(Vec<String>),
}

impl Vary {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut names = Vec::new();
        for value in headers.get_all(VARY) {
            let Ok(value) = value.to_str() else {
                continue;
            };
            for name in value.split(',').map(str::trim).filter(|name| !name.is_empty()) {
                if name == "*" {
                    return Self::Wildcard;
                }
                if !names.iter().any(|known: &String| known.eq_ignore_ascii_case(name)) {
                    names.push(name.to_string());
                }
            }
        }
        if names.is_empty() {
            Self::None
        } else {
            Self::Headers(names)
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        match self {
            Self::None => false,
            Self::Wildcard => true,
            Self::Headers(names) => names.iter().any(|known| known.eq_ignore_ascii_case(name)),
        }
    }

    pub fn names(&self) -> &[String] {
        match self {
            Self::Headers(names) => names,
            Self::None | Self::Wildcard => &[],
        }
    }
}

/// Captures the request's values for the given varied header names.
pub fn varied_values(names: &[String], request_headers: &HeaderMap) -> VariedValues {
    names
        .iter()
        .map(|name| (name.clone(), header_value(request_headers, name)))
        .collect()
}

/// True when the request carries the same values a variant was stored under.
pub fn matches(values: &[(String, String)], request_headers: &HeaderMap) -> bool {
    values
        .iter()
        .all(|(name, value)| header_value(request_headers, name) == *value)
}

/// Deterministic key suffix for a variant; empty when nothing varies.
pub fn key_suffix(values: &[(String, String)]) -> String {
    if values.is_empty() {
        return String::new();
    }
    let encoded: Vec<String> = values
        .iter()
        .map(|(name, value)| {
            if value.contains(';') || value.contains(':') {
                format!("{name}:{}", byte_serialize(value.as_bytes()).collect::<String>())
            } else {
                format!("{name}:{value}")
            }
        })
        .collect();
    format!("{VARY_SEPARATOR}{}", encoded.join(HEADER_SEPARATOR))
}

fn header_value(headers: &HeaderMap, name: &str) -> String {
    let values: Vec<&str> = headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();
    values.join(", ")
}
