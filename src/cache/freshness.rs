//! Storability and TTL computation, plus the freshness checks applied to
//! cached entries on lookup.

use std::time::{Duration, SystemTime};

use axum::http::{
    HeaderMap, HeaderValue, StatusCode,
    header::{AUTHORIZATION, CACHE_CONTROL, DATE, EXPIRES},
};

use super::context::RequestContext;
use super::directives::{MAX_DELTA_SECONDS, MaxStale, RequestDirectives, ResponseDirectives};
use super::status::{STORED_TTL, header_time};
use super::vary::Vary;

pub const CACHEABLE_STATUS_CODES: [u16; 11] =
    [200, 203, 204, 206, 300, 301, 404, 405, 410, 414, 501];

pub fn is_cacheable_status(status: StatusCode) -> bool {
    CACHEABLE_STATUS_CODES.contains(&status.as_u16())
}

/// 500/502/503/504 signal an upstream failure that may be masked by
/// `stale-if-error`.
pub fn is_upstream_error(status: StatusCode) -> bool {
    matches!(status.as_u16(), 500 | 502 | 503 | 504)
}

/// Why a response was not stored; rendered as the `Cache-Status` detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    UncacheableStatus,
    EmptyCacheControl,
    InvalidCacheControl,
    PrivateOrAuthenticated,
    VaryWildcard,
    NoStore,
}

impl SkipReason {
    pub fn detail(self) -> &'static str {
        match self {
            Self::UncacheableStatus => "UNCACHEABLE-STATUS-CODE",
            Self::EmptyCacheControl => "EMPTY-RESPONSE-CACHE-CONTROL",
            Self::InvalidCacheControl => "INVALID-RESPONSE-CACHE-CONTROL",
            Self::PrivateOrAuthenticated => "PRIVATE-OR-AUTHENTICATED-RESPONSE",
            Self::VaryWildcard => "UPSTREAM-VARY-STAR",
            Self::NoStore => "NO-STORE-DIRECTIVE",
        }
    }
}

/// What to persist for a storable response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePlan {
    /// Remaining fresh lifetime at the time of storing.
    pub ttl: Duration,
    /// Lifetime advertised by the response, before Date elapsed time.
    pub stored_ttl: Duration,
    /// Request header names the response varies on.
    pub vary: Vec<String>,
    /// Response headers to persist.
    pub headers: HeaderMap,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Storability {
    Store(StoragePlan),
    Skip(SkipReason),
}

/// Decides whether a response may be stored and for how long.
pub fn evaluate(
    status: StatusCode,
    response_headers: &HeaderMap,
    request_headers: &HeaderMap,
    request_directives: &RequestDirectives,
    ctx: &RequestContext,
) -> Storability {
    if !is_cacheable_status(status) {
        return Storability::Skip(SkipReason::UncacheableStatus);
    }

    let mut headers = response_headers.clone();
    if !headers.contains_key(CACHE_CONTROL) {
        match ctx
            .default_cache_control
            .as_deref()
            .and_then(|value| HeaderValue::from_str(value).ok())
        {
            Some(value) => {
                headers.insert(CACHE_CONTROL, value);
            }
            None => return Storability::Skip(SkipReason::EmptyCacheControl),
        }
    }

    let Ok(directives) = ResponseDirectives::from_headers(&headers) else {
        return Storability::Skip(SkipReason::InvalidCacheControl);
    };

    let vary = Vary::from_headers(&headers);
    if vary == Vary::Wildcard {
        return Storability::Skip(SkipReason::VaryWildcard);
    }

    if !ctx.mode.bypasses_response() {
        let exempt = ctx.key.ignores_header(AUTHORIZATION.as_str())
            || vary.contains(AUTHORIZATION.as_str());
        let authenticated = request_headers.contains_key(AUTHORIZATION)
            && !(directives.public || directives.s_maxage.is_some() || directives.must_revalidate);
        if !exempt && (directives.private.is_some() || authenticated) {
            return Storability::Skip(SkipReason::PrivateOrAuthenticated);
        }
        if directives.no_store {
            return Storability::Skip(SkipReason::NoStore);
        }
    }
    if request_directives.no_store && !ctx.mode.bypasses_request() {
        return Storability::Skip(SkipReason::NoStore);
    }

    let (stored_ttl, ttl) = lifetime(&directives, &headers, ctx.ttl, ctx.now);

    if let Some(fields) = directives.no_cache.as_ref() {
        for field in fields {
            headers.remove(field.as_str());
        }
    }
    if !headers.contains_key(DATE) {
        headers.insert(
            DATE,
            HeaderValue::from_str(&httpdate::fmt_http_date(ctx.now))
                .unwrap_or_else(|_| HeaderValue::from_static("")),
        );
    }
    headers.insert(STORED_TTL, HeaderValue::from(stored_ttl.as_secs()));

    Storability::Store(StoragePlan {
        ttl,
        stored_ttl,
        vary: vary.names().to_vec(),
        headers,
    })
}

/// Returns `(stored_ttl, remaining_ttl)`.
///
/// The advertised lifetime is `s-maxage`, else `max-age`, else the route TTL.
/// Time elapsed since `Date` is subtracted; an `Expires` promising a longer
/// remaining lifetime wins.
pub fn lifetime(
    directives: &ResponseDirectives,
    headers: &HeaderMap,
    route_ttl: Duration,
    now: SystemTime,
) -> (Duration, Duration) {
    let ceiling = Duration::from_secs(MAX_DELTA_SECONDS);
    let advertised = directives
        .s_maxage
        .or(directives.max_age)
        .map(Duration::from_secs)
        .unwrap_or(route_ttl)
        .min(ceiling);
    let elapsed = header_time(headers, &DATE)
        .and_then(|date| now.duration_since(date).ok())
        .unwrap_or(Duration::ZERO);
    let mut remaining = advertised.saturating_sub(elapsed);

    if let Some(expires) = header_time(headers, &EXPIRES)
        .and_then(|expires| expires.duration_since(now).ok())
        && expires > remaining
    {
        remaining = expires.min(ceiling);
    }

    (remaining.saturating_add(elapsed), remaining)
}

/// Request `max-age`: the entry's age must not exceed it.
pub fn max_age_allows(request: &RequestDirectives, age: u64) -> bool {
    request.max_age.is_none_or(|max_age| age <= max_age)
}

/// Request `min-fresh`: the entry must stay fresh for at least that long.
pub fn min_fresh_allows(request: &RequestDirectives, remaining_ttl: i64) -> bool {
    request
        .min_fresh
        .is_none_or(|min_fresh| remaining_ttl >= i64::try_from(min_fresh).unwrap_or(i64::MAX))
}

/// Request `max-stale`: how far past expiry an entry may be served.
pub fn max_stale_allows(request: &RequestDirectives, remaining_ttl: i64) -> bool {
    match request.max_stale {
        None => false,
        Some(MaxStale::Unbounded) => true,
        Some(MaxStale::Seconds(bound)) => {
            remaining_ttl.saturating_add(i64::try_from(bound).unwrap_or(i64::MAX)) >= 0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::config::CacheMode;
    use crate::cache::context::RequestContext;
    use crate::cache::keys::DerivedKey;

    fn ctx(now: SystemTime) -> RequestContext {
        RequestContext {
            cache_name: "Cachet".into(),
            mode: CacheMode::Strict,
            now,
            key: DerivedKey {
                key: "GET-http-example.com-/x".to_string(),
                hashed: false,
                displayable: true,
                ignored_headers: Vec::new(),
            },
            ttl: Duration::from_secs(120),
            stale: Duration::ZERO,
            default_cache_control: None,
        }
    }

    fn response(pairs: &[(&'static str, String)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(*name, HeaderValue::from_str(value).expect("valid header"));
        }
        headers
    }

    fn store(
        status: u16,
        headers: &HeaderMap,
        request: &HeaderMap,
        ctx: &RequestContext,
    ) -> Storability {
        evaluate(
            StatusCode::from_u16(status).expect("status"),
            headers,
            request,
            &RequestDirectives::default(),
            ctx,
        )
    }

    #[test]
    fn upstream_errors_are_not_stored() {
        let now = SystemTime::now();
        let headers = response(&[("cache-control", "max-age=60".into())]);
        assert!(is_upstream_error(StatusCode::BAD_GATEWAY));
        assert_eq!(
            store(502, &headers, &HeaderMap::new(), &ctx(now)),
            Storability::Skip(SkipReason::UncacheableStatus)
        );
    }

    #[test]
    fn not_found_with_max_age_is_stored() {
        let now = SystemTime::now();
        let headers = response(&[("cache-control", "max-age=60".into())]);
        let Storability::Store(plan) = store(404, &headers, &HeaderMap::new(), &ctx(now)) else {
            panic!("404 with max-age should be stored");
        };
        assert_eq!(plan.ttl, Duration::from_secs(60));
        assert!(plan.headers.contains_key(DATE));
        assert_eq!(plan.headers.get(STORED_TTL).expect("stored ttl"), "60");
    }

    #[test]
    fn ttl_subtracts_time_since_date() {
        let now = SystemTime::now();
        let date = httpdate::fmt_http_date(now - Duration::from_secs(30));
        let headers = response(&[("cache-control", "max-age=60".into()), ("date", date)]);
        let Storability::Store(plan) = store(200, &headers, &HeaderMap::new(), &ctx(now)) else {
            panic!("response should be stored");
        };
        let secs = plan.ttl.as_secs();
        assert!((29..=31).contains(&secs), "remaining ttl was {secs}");
        assert!((59..=61).contains(&plan.stored_ttl.as_secs()));
    }

    #[test]
    fn s_maxage_wins_and_expires_can_extend() {
        let now = SystemTime::now();
        let directives = ResponseDirectives::parse("max-age=60, s-maxage=10").expect("valid");
        let (_, ttl) = lifetime(&directives, &HeaderMap::new(), Duration::from_secs(120), now);
        assert_eq!(ttl, Duration::from_secs(10));

        let expires = httpdate::fmt_http_date(now + Duration::from_secs(300));
        let headers = response(&[("expires", expires)]);
        let (_, ttl) = lifetime(&directives, &headers, Duration::from_secs(120), now);
        assert!(ttl > Duration::from_secs(290));
    }

    #[test]
    fn lifetimes_are_clamped_to_max_delta_seconds() {
        let now = SystemTime::now();
        let directives = ResponseDirectives::parse("max-age=99999999999999999999").expect("valid");
        let (stored, ttl) = lifetime(&directives, &HeaderMap::new(), Duration::MAX, now);
        assert_eq!(ttl, Duration::from_secs(MAX_DELTA_SECONDS));
        assert_eq!(stored, Duration::from_secs(MAX_DELTA_SECONDS));

        let (_, route_ttl) =
            lifetime(&ResponseDirectives::default(), &HeaderMap::new(), Duration::MAX, now);
        assert_eq!(route_ttl, Duration::from_secs(MAX_DELTA_SECONDS));
    }

    #[test]
    fn missing_cache_control_uses_route_default_or_is_skipped() {
        let now = SystemTime::now();
        let headers = HeaderMap::new();
        assert_eq!(
            store(200, &headers, &HeaderMap::new(), &ctx(now)),
            Storability::Skip(SkipReason::EmptyCacheControl)
        );

        let mut with_default = ctx(now);
        with_default.default_cache_control = Some("public".to_string());
        let Storability::Store(plan) = store(200, &headers, &HeaderMap::new(), &with_default)
        else {
            panic!("default cache-control should allow storing");
        };
        assert_eq!(plan.ttl, Duration::from_secs(120));
    }

    #[test]
    fn private_and_authorized_responses_are_rejected_unless_exempt() {
        let now = SystemTime::now();
        let private = response(&[("cache-control", "private, max-age=60".into())]);
        assert_eq!(
            store(200, &private, &HeaderMap::new(), &ctx(now)),
            Storability::Skip(SkipReason::PrivateOrAuthenticated)
        );

        let request = response(&[("authorization", "Bearer t".into())]);
        let plain = response(&[("cache-control", "max-age=60".into())]);
        assert_eq!(
            store(200, &plain, &request, &ctx(now)),
            Storability::Skip(SkipReason::PrivateOrAuthenticated)
        );

        let varied = response(&[
            ("cache-control", "max-age=60".into()),
            ("vary", "Authorization".into()),
        ]);
        assert!(matches!(
            store(200, &varied, &request, &ctx(now)),
            Storability::Store(_)
        ));

        let mut bypass = ctx(now);
        bypass.mode = CacheMode::BypassResponse;
        assert!(matches!(
            store(200, &private, &HeaderMap::new(), &bypass),
            Storability::Store(_)
        ));
    }

    #[test]
    fn vary_wildcard_and_no_store_are_rejected() {
        let now = SystemTime::now();
        let star = response(&[("cache-control", "max-age=60".into()), ("vary", "*".into())]);
        assert_eq!(
            store(200, &star, &HeaderMap::new(), &ctx(now)),
            Storability::Skip(SkipReason::VaryWildcard)
        );
        let no_store = response(&[("cache-control", "no-store".into())]);
        assert_eq!(
            store(200, &no_store, &HeaderMap::new(), &ctx(now)),
            Storability::Skip(SkipReason::NoStore)
        );
    }

    #[test]
    fn no_cache_fields_are_stripped() {
        let now = SystemTime::now();
        let headers = response(&[
            ("cache-control", "max-age=60, no-cache=\"Set-Cookie\"".into()),
            ("set-cookie", "session=1".into()),
        ]);
        let Storability::Store(plan) = store(200, &headers, &HeaderMap::new(), &ctx(now)) else {
            panic!("response should be stored");
        };
        assert!(!plan.headers.contains_key("set-cookie"));
    }

    #[test]
    fn request_freshness_bounds() {
        let request = RequestDirectives::parse("max-age=10, min-fresh=5").expect("valid");
        assert!(max_age_allows(&request, 10));
        assert!(!max_age_allows(&request, 11));
        assert!(min_fresh_allows(&request, 5));
        assert!(!min_fresh_allows(&request, 4));

        let stale = RequestDirectives::parse("max-stale=10").expect("valid");
        assert!(max_stale_allows(&stale, -10));
        assert!(!max_stale_allows(&stale, -11));
        assert!(!max_stale_allows(&RequestDirectives::default(), -1));
    }
}
