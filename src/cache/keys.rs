//! Cache key derivation.
//!
//! A key is the `-`-joined concatenation of method, scheme, host, path, query,
//! request body digest and configured header values, each toggled by
//! [`KeyFlags`]. Components are not escaped, so two distinct requests can in
//! principle produce the same key string.

use axum::http::{HeaderMap, Method, Uri, header::HOST};
use regex::Regex;
use sha2::{Digest, Sha256};

use super::config::{KeyFlags, KeyOverride};

/// Output of key derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedKey {
    pub key: String,
    pub hashed: bool,
    pub displayable: bool,
    /// Header names folded into the key. Responses varying on these, or tied
    /// to them (e.g. `Authorization`), are already distinguished per key.
    pub ignored_headers: Vec<String>,
}

impl DerivedKey {
    /// The key as it may appear in diagnostics; empty when hidden.
    pub fn display(&self) -> &str {
        if self.displayable { &self.key } else { "" }
    }

    pub fn ignores_header(&self, name: &str) -> bool {
        self.ignored_headers
            .iter()
            .any(|known| known.eq_ignore_ascii_case(name))
    }
}

/// Request fields consumed by [`KeyDeriver::derive`].
#[derive(Debug, Clone, Copy)]
pub struct KeyRequest<'a> {
    pub method: &'a Method,
    pub uri: &'a Uri,
    pub headers: &'a HeaderMap,
    /// `-<sha256 hex>` of the request body, or empty for an empty body.
    pub body_digest: &'a str,
}

#[derive(Debug, Clone)]
struct CompiledOverride {
    pattern: Regex,
    flags: KeyFlags,
}

#[derive(Debug, Clone)]
pub struct KeyDeriver {
    base: KeyFlags,
    overrides: Vec<CompiledOverride>,
}

impl KeyDeriver {
    pub fn new(base: KeyFlags, overrides: &[KeyOverride]) -> Result<Self, regex::Error> {
        let overrides = overrides
            .iter()
            .map(|rule| {
                Ok(CompiledOverride {
                    pattern: Regex::new(&rule.pattern)?,
                    flags: rule.key.clone(),
                })
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self { base, overrides })
    }

    /// Flags in effect for a request URI; the first matching override replaces
    /// the base flags entirely.
    fn flags_for(&self, request_uri: &str) -> &KeyFlags {
        self.overrides
            .iter()
            .find(|rule| rule.pattern.is_match(request_uri))
            .map(|rule| &rule.flags)
            .unwrap_or(&self.base)
    }

    pub fn derive(&self, request: KeyRequest<'_>) -> DerivedKey {
        let request_uri = request
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let flags = self.flags_for(request_uri);

        let mut key = String::new();
        if !flags.disable_method {
            key.push_str(request.method.as_str());
            key.push('-');
        }
        if !flags.disable_scheme {
            key.push_str(if is_https(request.uri, request.headers) {
                "https-"
            } else {
                "http-"
            });
        }
        if !flags.disable_host {
            key.push_str(host(request.uri, request.headers));
            key.push('-');
        }
        key.push_str(request.uri.path());
        if !flags.disable_query
            && let Some(query) = request.uri.query()
        {
            key.push('?');
            key.push_str(query);
        }
        if !flags.disable_body {
            key.push_str(request.body_digest);
        }
        for name in &flags.headers {
            key.push('-');
            key.push_str(
                request
                    .headers
                    .get(name.as_str())
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or(""),
            );
        }

        if flags.hash {
            key = sha256_hex(key.as_bytes());
        }

        DerivedKey {
            key,
            hashed: flags.hash,
            displayable: !flags.hide,
            ignored_headers: flags.headers.clone(),
        }
    }
}

/// Digest contributed by a request body to the key.
pub fn body_digest(body: &[u8]) -> String {
    if body.is_empty() {
        return String::new();
    }
    format!("-{}", sha256_hex(body))
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize().to_vec())
}

fn is_https(uri: &Uri, headers: &HeaderMap) -> bool {
    uri.scheme_str() == Some("https")
        || headers
            .get("x-forwarded-proto")
            .and_then(|value| value.to_str().ok())
            .is_some_and(|proto| proto.eq_ignore_ascii_case("https"))
}

fn host<'a>(uri: &'a Uri, headers: &'a HeaderMap) -> &'a str {
    headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| uri.host())
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    fn derive(
        deriver: &KeyDeriver,
        method: Method,
        uri: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> DerivedKey {
        let uri: Uri = uri.parse().expect("valid uri");
        let digest = body_digest(body);
        deriver.derive(KeyRequest {
            method: &method,
            uri: &uri,
            headers,
            body_digest: &digest,
        })
    }

    #[test]
    fn builds_key_in_fixed_order() {
        let deriver = KeyDeriver::new(KeyFlags::default(), &[]).expect("deriver");
        let request_headers = headers(&[("host", "example.com")]);
        let derived = derive(&deriver, Method::GET, "/x?a=1", &request_headers, b"");
        assert_eq!(derived.key, "GET-http-example.com-/x?a=1");
        assert!(derived.displayable);
        assert!(!derived.hashed);
    }

    #[test]
    fn derivation_is_deterministic() {
        let deriver = KeyDeriver::new(KeyFlags::default(), &[]).expect("deriver");
        let request_headers = headers(&[("host", "example.com")]);
        let first = derive(&deriver, Method::POST, "/q", &request_headers, b"{}");
        let second = derive(&deriver, Method::POST, "/q", &request_headers, b"{}");
        assert_eq!(first, second);
        assert!(first.key.starts_with("POST-http-example.com-/q-"));
    }

    #[test]
    fn disabled_fields_do_not_affect_key() {
        let flags = KeyFlags {
            disable_query: true,
            disable_body: true,
            ..Default::default()
        };
        let deriver = KeyDeriver::new(flags, &[]).expect("deriver");
        let request_headers = headers(&[("host", "example.com")]);
        let first = derive(&deriver, Method::GET, "/x?a=1", &request_headers, b"one");
        let second = derive(&deriver, Method::GET, "/x?a=2", &request_headers, b"two");
        assert_eq!(first.key, second.key);
    }

    #[test]
    fn https_scheme_from_forwarded_proto() {
        let deriver = KeyDeriver::new(KeyFlags::default(), &[]).expect("deriver");
        let request_headers = headers(&[("host", "example.com"), ("x-forwarded-proto", "https")]);
        let derived = derive(&deriver, Method::GET, "/", &request_headers, b"");
        assert_eq!(derived.key, "GET-https-example.com-/");
    }

    #[test]
    fn first_matching_override_replaces_base_headers() {
        let base = KeyFlags {
            headers: vec!["X-Base".to_string()],
            ..Default::default()
        };
        let overrides = vec![
            KeyOverride {
                pattern: "^/api/".to_string(),
                key: KeyFlags {
                    disable_host: true,
                    headers: vec!["X-Tenant".to_string()],
                    ..Default::default()
                },
            },
            KeyOverride {
                pattern: "^/api/v1".to_string(),
                key: KeyFlags {
                    disable_method: true,
                    ..Default::default()
                },
            },
        ];
        let deriver = KeyDeriver::new(base, &overrides).expect("deriver");
        let request_headers = headers(&[
            ("host", "example.com"),
            ("x-base", "base"),
            ("x-tenant", "acme"),
        ]);

        let derived = derive(&deriver, Method::GET, "/api/v1/items", &request_headers, b"");
        assert_eq!(derived.key, "GET-http-/api/v1/items-acme");
        assert_eq!(derived.ignored_headers, vec!["X-Tenant".to_string()]);

        let plain = derive(&deriver, Method::GET, "/home", &request_headers, b"");
        assert_eq!(plain.key, "GET-http-example.com-/home-base");
    }

    #[test]
    fn hash_and_hide_flags() {
        let flags = KeyFlags {
            hash: true,
            hide: true,
            ..Default::default()
        };
        let deriver = KeyDeriver::new(flags, &[]).expect("deriver");
        let request_headers = headers(&[("host", "example.com")]);
        let derived = derive(&deriver, Method::GET, "/x", &request_headers, b"");
        assert!(derived.hashed);
        assert_eq!(derived.key.len(), 64);
        assert_eq!(derived.display(), "");
    }

    #[test]
    fn invalid_override_pattern_is_rejected() {
        let overrides = vec![KeyOverride {
            pattern: "(".to_string(),
            key: KeyFlags::default(),
        }];
        assert!(KeyDeriver::new(KeyFlags::default(), &overrides).is_err());
    }
}
