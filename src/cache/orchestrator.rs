//! Per-request cache state machine.
//!
//! Every request walks the same states: internal endpoints, exclusions,
//! uncacheable methods and malformed Cache-Control are forwarded untouched;
//! everything else is keyed and looked up. Fresh entries are replayed (or
//! answered with 304), stale ones may be served while or instead of
//! revalidating, and misses go upstream through the coalescer so concurrent
//! requests for one key cost a single origin round trip.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use axum::{
    body::Body,
    http::{
        HeaderMap, HeaderValue, Method, Request, StatusCode, Uri,
        header::{
            AGE, CACHE_CONTROL, DATE, ETAG, EXPIRES, IF_MODIFIED_SINCE, IF_NONE_MATCH, IF_RANGE,
            LAST_MODIFIED, RANGE, UPGRADE, VARY,
        },
    },
    response::{IntoResponse, Response},
};
use metrics::{counter, histogram};
use regex::Regex;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use super::api;
use super::coalescing::Coalescer;
use super::config::CacheConfig;
use super::context::{RequestContext, RequestParts};
use super::directives::{RequestDirectives, ResponseDirectives};
use super::entry::ResponseSnapshot;
use super::error::{BuildError, CoalesceError, OriginError};
use super::fanout::{Lookup, StorageFanout};
use super::freshness::{self, Storability, is_upstream_error};
use super::keys::{KeyDeriver, KeyRequest, body_digest};
use super::origin::Origin;
use super::status::{
    self, CacheStatus, STORED_HIDDEN, STORED_LENGTH, STORED_TTL, header_time, refresh_age,
    strip_internal,
};
use super::storer::{MemoryStorer, Storer, VariantWrite};
use super::surrogate::SurrogateIndex;
use super::validator::Revalidator;
use super::vary::{self, VariedValues};

const METRIC_HIT_TOTAL: &str = "cachet_cache_hit_total";
const METRIC_MISS_TOTAL: &str = "cachet_cache_miss_total";
const METRIC_STALE_TOTAL: &str = "cachet_cache_stale_total";
const METRIC_COALESCED_TOTAL: &str = "cachet_coalesced_total";
const METRIC_ORIGIN_MS: &str = "cachet_origin_fetch_ms";

/// A GraphQL write sent through a customised method list.
const MUTATION_PREFIX: &[u8] = b"{\"query\":\"mutation";

/// What the coalesced work hands to every waiter.
#[derive(Debug, Clone)]
struct Fetched {
    /// Response as delivered, annotated and stripped of internal headers.
    response: ResponseSnapshot,
    /// Status the origin actually answered with (304 on a confirmed entry).
    origin_status: StatusCode,
    vary: Vec<String>,
    varied: VariedValues,
}

type Outcome = Result<Fetched, OriginError>;

#[derive(Debug, Error)]
enum DispatchError {
    #[error("origin did not answer before the deadline")]
    Deadline,
    #[error(transparent)]
    Origin(#[from] OriginError),
    #[error(transparent)]
    Abandoned(#[from] CoalesceError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Upstream,
    Revalidate,
}

struct CompiledRoute {
    pattern: Regex,
    ttl: Option<Duration>,
    default_cache_control: Option<String>,
}

struct Inner {
    config: CacheConfig,
    name: Arc<str>,
    api_base: String,
    methods: Vec<Method>,
    inspect_bodies: bool,
    exclude: Option<Regex>,
    keys: KeyDeriver,
    routes: Vec<CompiledRoute>,
    storage: StorageFanout,
    surrogate: SurrogateIndex,
    coalescer: Coalescer<Outcome>,
}

/// The cache engine. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct HttpCache {
    inner: Arc<Inner>,
}

impl HttpCache {
    /// Compiles every configured pattern and wires the storers. An empty
    /// storer list falls back to a single in-memory storer.
    pub fn new(config: CacheConfig, storers: Vec<Arc<dyn Storer>>) -> Result<Self, BuildError> {
        let exclude = config
            .exclude
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|err| BuildError::pattern("exclude", err))?;
        let keys = KeyDeriver::new(config.key.clone(), &config.key_overrides)
            .map_err(|err| BuildError::pattern("key_overrides", err))?;
        let routes = config
            .routes
            .iter()
            .map(|rule| {
                Ok(CompiledRoute {
                    pattern: Regex::new(&rule.pattern)
                        .map_err(|err| BuildError::pattern("routes", err))?,
                    ttl: rule.ttl_secs.map(Duration::from_secs),
                    default_cache_control: rule.default_cache_control.clone(),
                })
            })
            .collect::<Result<Vec<_>, BuildError>>()?;

        let storers = if storers.is_empty() {
            vec![Arc::new(MemoryStorer::new(&config)) as Arc<dyn Storer>]
        } else {
            storers
        };

        Ok(Self {
            inner: Arc::new(Inner {
                name: Arc::from(config.cache_name.as_str()),
                api_base: config.api.base_path.trim_end_matches('/').to_string(),
                methods: config.allowed_methods(),
                inspect_bodies: config.has_custom_methods(),
                exclude,
                keys,
                routes,
                storage: StorageFanout::new(storers, config.storage_timeout()),
                surrogate: SurrogateIndex::new(&config)?,
                coalescer: Coalescer::new(),
                config,
            }),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn storage(&self) -> &StorageFanout {
        &self.inner.storage
    }

    pub fn surrogate(&self) -> &SurrogateIndex {
        &self.inner.surrogate
    }

    pub(crate) fn api_base(&self) -> &str {
        &self.inner.api_base
    }

    /// Deletes `keys` from every storer.
    pub async fn evict(&self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        self.inner.storage.delete(keys).await;
    }

    /// Drops every stored entry and every surrogate tag.
    pub async fn flush(&self) {
        self.inner.storage.reset().await;
        self.inner.surrogate.reset();
    }

    #[instrument(
        skip_all,
        fields(cache = %self.inner.name, method = %request.method(), uri = %request.uri())
    )]
    pub async fn handle<O: Origin>(&self, request: Request<Body>, origin: O) -> Response {
        let inner = &self.inner;

        if inner.config.api.enabled && api::is_internal(&inner.api_base, request.uri().path()) {
            return api::handle(self, request).await;
        }

        if is_websocket(request.headers())
            || inner
                .exclude
                .as_ref()
                .is_some_and(|pattern| pattern.is_match(request_uri(request.uri())))
        {
            return self
                .bypass(origin, request, "EXCLUDED-REQUEST-URI", false)
                .await;
        }

        if !inner.methods.contains(request.method()) {
            return self
                .bypass(origin, request, "UNSUPPORTED-METHOD", true)
                .await;
        }

        let directives = if inner.config.mode.bypasses_request() {
            RequestDirectives::default()
        } else {
            match RequestDirectives::from_headers(request.headers()) {
                Ok(directives) => directives,
                Err(err) => {
                    debug!(error = %err, "unparsable request cache-control");
                    return self
                        .bypass(origin, request, "CACHE-CONTROL-EXTRACTION-ERROR", true)
                        .await;
                }
            }
        };

        let (head, body) = request.into_parts();
        let body = match axum::body::to_bytes(body, inner.config.max_body_bytes).await {
            Ok(body) => body,
            Err(err) => {
                warn!(error = %err, "request body exceeds the buffering limit");
                let mut response = StatusCode::PAYLOAD_TOO_LARGE.into_response();
                CacheStatus::bypass(&inner.name, "REQUEST-BODY-TOO-LARGE")
                    .apply(response.headers_mut());
                return response;
            }
        };
        let parts = RequestParts {
            method: head.method,
            uri: head.uri,
            version: head.version,
            headers: head.headers,
            body,
        };

        if inner.inspect_bodies && is_mutation(&parts.body) {
            return self
                .bypass(origin, parts.to_request(), "IS-MUTATION-REQUEST", true)
                .await;
        }

        let ctx = self.context(&parts);
        let mut validator = Revalidator::from_request(&parts.headers);

        if !directives.no_cache
            && let Some(lookup) = inner
                .storage
                .lookup(&ctx.key.key, &parts.headers, &mut validator, ctx.now)
                .await
            && let Some(response) = self
                .serve_lookup(lookup, origin.clone(), &parts, &ctx, &directives, &mut validator)
                .await
        {
            return response;
        }

        if directives.only_if_cached {
            debug!(key = ctx.key.display(), outcome = "only_if_cached", "no servable entry");
            let mut response = StatusCode::GATEWAY_TIMEOUT.into_response();
            CacheStatus::forward(&inner.name, "uri-miss")
                .key(ctx.key.display())
                .detail("ONLY-IF-CACHED")
                .apply(response.headers_mut());
            return response;
        }

        counter!(METRIC_MISS_TOTAL).increment(1);
        debug!(key = ctx.key.display(), outcome = "miss", "forwarding to origin");
        match self
            .dispatch(origin, &parts, &ctx, &directives, None)
            .await
        {
            Ok(fetched) => self.deliver(fetched, &mut validator, Flow::Upstream),
            Err(err) => self.failure(&ctx, &err, "uri-miss"),
        }
    }

    fn context(&self, parts: &RequestParts) -> RequestContext {
        let inner = &self.inner;
        let digest = body_digest(&parts.body);
        let key = inner.keys.derive(KeyRequest {
            method: &parts.method,
            uri: &parts.uri,
            headers: &parts.headers,
            body_digest: &digest,
        });
        let route = inner
            .routes
            .iter()
            .find(|route| route.pattern.is_match(parts.request_uri()));

        RequestContext {
            cache_name: Arc::clone(&inner.name),
            mode: inner.config.mode,
            now: SystemTime::now(),
            key,
            ttl: route
                .and_then(|route| route.ttl)
                .unwrap_or_else(|| inner.config.ttl()),
            stale: inner.config.stale(),
            default_cache_control: route
                .and_then(|route| route.default_cache_control.clone())
                .or_else(|| inner.config.default_cache_control.clone()),
        }
    }

    /// Decides what to do with stored candidates. `None` means go upstream.
    async fn serve_lookup<O: Origin>(
        &self,
        lookup: Lookup,
        origin: O,
        parts: &RequestParts,
        ctx: &RequestContext,
        directives: &RequestDirectives,
        validator: &mut Revalidator,
    ) -> Option<Response> {
        let name = &*self.inner.name;
        let key = ctx.key.display();

        if let Some(mut fresh) = lookup.fresh {
            let ttl = refresh_age(&mut fresh.headers, ctx.now);
            let cached = ResponseDirectives::from_headers(&fresh.headers).unwrap_or_default();
            let status = CacheStatus::hit(name, ttl, key, &lookup.storer);

            if validator.matched && validator.not_modified {
                counter!(METRIC_HIT_TOTAL).increment(1);
                debug!(key, outcome = "not_modified", "conditional hit");
                let mut response = fresh.headers_only(StatusCode::NOT_MODIFIED);
                strip_internal(response.headers_mut());
                status.apply(response.headers_mut());
                return Some(response);
            }

            if validator.need_revalidation || cached.requires_revalidation() {
                debug!(key, outcome = "revalidate", "fresh entry needs confirmation");
                return Some(
                    match self
                        .dispatch(origin, parts, ctx, directives, Some(fresh))
                        .await
                    {
                        Ok(fetched) => self.deliver(fetched, validator, Flow::Revalidate),
                        Err(err) => self.failure(ctx, &err, "request"),
                    },
                );
            }

            let servable = !ctx.mode.is_strict()
                || (freshness::max_age_allows(directives, status::age(&fresh.headers))
                    && freshness::min_fresh_allows(directives, ttl));
            if servable {
                counter!(METRIC_HIT_TOTAL).increment(1);
                debug!(key, outcome = "hit", ttl, "serving fresh entry");
                return Some(replay(fresh, &status));
            }
            return None;
        }

        let mut stale = lookup.stale?;
        let ttl = refresh_age(&mut stale.headers, ctx.now);
        let cached = ResponseDirectives::from_headers(&stale.headers).unwrap_or_default();
        let overdue = ttl.min(0).unsigned_abs();
        let while_revalidate = cached
            .stale_while_revalidate
            .is_some_and(|budget| budget > 0 && overdue <= budget);
        let if_error = directives
            .stale_if_error
            .or(cached.stale_if_error)
            .is_some_and(|budget| overdue <= budget);
        if directives.max_stale.is_none() && !while_revalidate && !if_error {
            return None;
        }
        let status = CacheStatus::hit(name, ttl, key, &lookup.storer).stale();

        if while_revalidate {
            counter!(METRIC_STALE_TOTAL).increment(1);
            debug!(key, outcome = "stale_while_revalidate", "serving stale entry");
            self.revalidate_in_background(origin, parts, ctx, directives, stale.clone());
            return Some(replay(stale, &status));
        }

        if cached.must_revalidate || cached.requires_revalidation() || validator.need_revalidation {
            let outcome = self
                .dispatch(origin, parts, ctx, directives, Some(stale.clone()))
                .await;
            return Some(match outcome {
                Ok(fetched) if !is_upstream_error(fetched.origin_status) => {
                    self.deliver(fetched, validator, Flow::Revalidate)
                }
                _ if if_error => {
                    counter!(METRIC_STALE_TOTAL).increment(1);
                    debug!(key, outcome = "stale_if_error", "revalidation failed");
                    replay(stale, &status)
                }
                Ok(fetched) => {
                    warn!(
                        key,
                        status = fetched.origin_status.as_u16(),
                        "revalidation failed without stale fallback"
                    );
                    let mut response = StatusCode::GATEWAY_TIMEOUT.into_response();
                    CacheStatus::forward(name, "request")
                        .key(key)
                        .detail("UPSTREAM-ERROR")
                        .apply(response.headers_mut());
                    response
                }
                Err(err) => self.failure(ctx, &err, "request"),
            });
        }

        if if_error {
            let outcome = self
                .dispatch(origin, parts, ctx, directives, None)
                .await;
            return Some(match outcome {
                Ok(fetched) if !is_upstream_error(fetched.origin_status) => {
                    self.deliver(fetched, validator, Flow::Upstream)
                }
                _ => {
                    counter!(METRIC_STALE_TOTAL).increment(1);
                    debug!(key, outcome = "stale_if_error", "origin failed");
                    replay(stale, &status)
                }
            });
        }

        if freshness::max_stale_allows(directives, ttl) {
            counter!(METRIC_STALE_TOTAL).increment(1);
            debug!(key, outcome = "stale", ttl, "serving stale entry");
            return Some(replay(stale, &status));
        }
        None
    }

    fn revalidate_in_background<O: Origin>(
        &self,
        origin: O,
        parts: &RequestParts,
        ctx: &RequestContext,
        directives: &RequestDirectives,
        cached: ResponseSnapshot,
    ) {
        let cache = self.clone();
        let parts = parts.clone();
        let ctx = ctx.clone();
        let directives = directives.clone();
        tokio::spawn(async move {
            match cache
                .dispatch(origin, &parts, &ctx, &directives, Some(cached))
                .await
            {
                Ok(fetched) => debug!(
                    key = ctx.key.display(),
                    status = fetched.origin_status.as_u16(),
                    "background revalidation finished"
                ),
                Err(err) => warn!(
                    key = ctx.key.display(),
                    error = %err,
                    "background revalidation failed"
                ),
            }
        });
    }

    /// Runs the origin work through the coalescer under the request deadline.
    ///
    /// A caller that joined work whose response varies on headers it does not
    /// share re-dispatches under a key widened by its own varied values.
    async fn dispatch<O: Origin>(
        &self,
        origin: O,
        parts: &RequestParts,
        ctx: &RequestContext,
        directives: &RequestDirectives,
        cached: Option<ResponseSnapshot>,
    ) -> Result<Fetched, DispatchError> {
        tokio::time::timeout(
            self.inner.config.backend_timeout(),
            self.coalesce(origin, parts, ctx, directives, cached),
        )
        .await
        .map_err(|_| DispatchError::Deadline)?
    }

    async fn coalesce<O: Origin>(
        &self,
        origin: O,
        parts: &RequestParts,
        ctx: &RequestContext,
        directives: &RequestDirectives,
        cached: Option<ResponseSnapshot>,
    ) -> Result<Fetched, DispatchError> {
        let mut flight_key = ctx.key.key.clone();
        loop {
            let work = {
                let cache = self.clone();
                let origin = origin.clone();
                let parts = parts.clone();
                let ctx = ctx.clone();
                let directives = directives.clone();
                let cached = cached.clone();
                move || cache.fetch(origin, parts, ctx, directives, cached)
            };
            let (outcome, shared) = self.inner.coalescer.run(&flight_key, work).await?;
            let fetched = outcome?;
            if !shared {
                return Ok(fetched);
            }

            counter!(METRIC_COALESCED_TOTAL).increment(1);
            if !vary::matches(&fetched.varied, &parts.headers) {
                let own = vary::varied_values(&fetched.vary, &parts.headers);
                let widened = format!("{}{}", ctx.key.key, vary::key_suffix(&own));
                if widened != flight_key {
                    debug!(key = ctx.key.display(), "shared response varies, dispatching again");
                    flight_key = widened;
                    continue;
                }
            }
            return Ok(fetched);
        }
    }

    /// The coalesced unit of work: one origin round trip plus storage.
    async fn fetch<O: Origin>(
        self,
        origin: O,
        parts: RequestParts,
        ctx: RequestContext,
        directives: RequestDirectives,
        cached: Option<ResponseSnapshot>,
    ) -> Outcome {
        let inner = &self.inner;
        let mut outbound = parts.clone();
        // The shared fetch always asks for the whole representation.
        for name in [IF_NONE_MATCH, IF_MODIFIED_SINCE, RANGE, IF_RANGE] {
            outbound.headers.remove(name);
        }
        if let Some(cached) = &cached {
            if let Some(etag) = cached.headers.get(ETAG) {
                outbound.headers.insert(IF_NONE_MATCH, etag.clone());
            }
            if let Some(modified) = cached.headers.get(LAST_MODIFIED) {
                outbound.headers.insert(IF_MODIFIED_SINCE, modified.clone());
            }
        }

        let started = Instant::now();
        let response = tokio::time::timeout(
            inner.config.backend_timeout(),
            origin.forward(outbound.to_request()),
        )
        .await
        .map_err(|_| OriginError::Transport("origin did not answer before the deadline".into()))??;
        let response = ResponseSnapshot::capture(response, inner.config.max_body_bytes).await?;
        histogram!(METRIC_ORIGIN_MS).record(started.elapsed().as_secs_f64() * 1000.0);

        let invalidated = inner.surrogate.invalidate(&parts.method, &response.headers);
        self.evict(&invalidated).await;

        let origin_status = response.status;
        let key = ctx.key.display();
        match cached {
            None => {
                let status = CacheStatus::forward(&inner.name, "uri-miss").key(key);
                Ok(self
                    .persist(response, origin_status, &parts, &ctx, &directives, status)
                    .await)
            }
            Some(cached) => {
                let status = CacheStatus::forward(&inner.name, "request")
                    .param("fwd-status", origin_status.as_u16())
                    .key(key)
                    .detail("REQUEST-REVALIDATION");
                let response = if origin_status == StatusCode::NOT_MODIFIED {
                    confirm(cached, &response.headers)
                } else {
                    response
                };
                Ok(self
                    .persist(response, origin_status, &parts, &ctx, &directives, status)
                    .await)
            }
        }
    }

    /// Stores a storable response in every storer and indexes its tags, then
    /// returns it in delivered form.
    async fn persist(
        &self,
        mut response: ResponseSnapshot,
        origin_status: StatusCode,
        parts: &RequestParts,
        ctx: &RequestContext,
        directives: &RequestDirectives,
        mut status: CacheStatus,
    ) -> Fetched {
        let inner = &self.inner;
        let tags = inner.surrogate.tags(&response.headers);
        let mut vary_names = Vec::new();
        let mut varied = Vec::new();

        match freshness::evaluate(
            response.status,
            &response.headers,
            &parts.headers,
            directives,
            ctx,
        ) {
            Storability::Skip(reason) => {
                debug!(key = ctx.key.display(), detail = reason.detail(), "response not stored");
                status = status.detail(reason.detail());
            }
            Storability::Store(plan) => {
                varied = vary::varied_values(&plan.vary, &parts.headers);
                vary_names = plan.vary;
                let variant_key = format!("{}{}", ctx.key.key, vary::key_suffix(&varied));

                let mut headers = plan.headers;
                inner.surrogate.rewrite(&mut headers, &tags);
                headers.insert(STORED_LENGTH, HeaderValue::from(response.body.len()));
                if ctx.key.displayable {
                    headers.remove(STORED_HIDDEN);
                } else {
                    headers.insert(STORED_HIDDEN, HeaderValue::from_static("1"));
                }
                let entry = ResponseSnapshot {
                    status: response.status,
                    headers,
                    body: response.body.clone(),
                };

                match entry.encode() {
                    Ok(value) => {
                        let outcome = inner
                            .storage
                            .store(VariantWrite {
                                base_key: &ctx.key.key,
                                variant_key: &variant_key,
                                value,
                                varied: &varied,
                                etag: entry.etag(),
                                ttl: plan.ttl,
                                stale: ctx.stale,
                                now: ctx.now,
                            })
                            .await;
                        for detail in outcome.details() {
                            status = status.detail(&detail);
                        }
                        if outcome.stored {
                            inner.surrogate.register(&tags, &variant_key);
                            status = status.stored();
                            debug!(
                                key = ctx.key.display(),
                                ttl = plan.ttl.as_secs(),
                                "response stored"
                            );
                        }
                    }
                    Err(err) => {
                        warn!(key = ctx.key.display(), error = %err, "response could not be encoded");
                        status = status.detail("STORAGE-ENCODING-ERROR");
                    }
                }
            }
        }

        inner.surrogate.rewrite(&mut response.headers, &tags);
        strip_internal(&mut response.headers);
        status.apply(&mut response.headers);
        Fetched {
            response,
            origin_status,
            vary: vary_names,
            varied,
        }
    }

    /// Adapts the shared outcome to this caller's conditional headers.
    fn deliver(&self, fetched: Fetched, validator: &mut Revalidator, flow: Flow) -> Response {
        let Fetched {
            response,
            origin_status,
            ..
        } = fetched;

        if flow == Flow::Revalidate
            && validator.if_unmodified_since_present
            && origin_status != StatusCode::NOT_MODIFIED
        {
            return response.headers_only(StatusCode::PRECONDITION_FAILED);
        }

        if response.status.is_success() {
            if validator.if_none_match.is_some() {
                validator.evaluate(response.etag());
                if validator.not_modified {
                    return response.headers_only(StatusCode::NOT_MODIFIED);
                }
            } else if !validator.sent_entity_tags()
                && unmodified_since(&response.headers, validator.if_modified_since)
            {
                return response.headers_only(StatusCode::NOT_MODIFIED);
            }
        }
        response.into_response()
    }

    fn failure(&self, ctx: &RequestContext, err: &DispatchError, reason: &str) -> Response {
        let (code, detail) = match err {
            DispatchError::Deadline => (StatusCode::GATEWAY_TIMEOUT, "DEADLINE-EXCEEDED"),
            DispatchError::Origin(_) | DispatchError::Abandoned(_) => {
                (StatusCode::BAD_GATEWAY, "UPSTREAM-ERROR")
            }
        };
        warn!(key = ctx.key.display(), error = %err, detail, "origin round trip failed");
        let mut response = code.into_response();
        CacheStatus::forward(&self.inner.name, reason)
            .key(ctx.key.display())
            .detail(detail)
            .apply(response.headers_mut());
        response
    }

    /// Forwards without caching; optionally purges the tags the response
    /// names for group invalidation.
    async fn bypass<O: Origin>(
        &self,
        origin: O,
        request: Request<Body>,
        detail: &str,
        invalidate: bool,
    ) -> Response {
        debug!(outcome = "bypass", detail, "forwarding without cache");
        let method = request.method().clone();
        let mut response = match tokio::time::timeout(
            self.inner.config.backend_timeout(),
            origin.forward(request),
        )
        .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                warn!(error = %err, "origin round trip failed");
                StatusCode::BAD_GATEWAY.into_response()
            }
            Err(_) => StatusCode::GATEWAY_TIMEOUT.into_response(),
        };

        if invalidate {
            let keys = self
                .inner
                .surrogate
                .invalidate(&method, response.headers());
            self.evict(&keys).await;
        }
        CacheStatus::bypass(&self.inner.name, detail).apply(response.headers_mut());
        response
    }
}

fn replay(mut snapshot: ResponseSnapshot, status: &CacheStatus) -> Response {
    strip_internal(&mut snapshot.headers);
    status.apply(&mut snapshot.headers);
    snapshot.into_response()
}

/// Refreshes a stored entry with the metadata of a 304 confirming it.
fn confirm(mut cached: ResponseSnapshot, not_modified: &HeaderMap) -> ResponseSnapshot {
    cached.headers.remove(AGE);
    cached.headers.remove(STORED_TTL);
    cached.headers.remove(STORED_LENGTH);
    if !not_modified.contains_key(DATE) {
        cached.headers.remove(DATE);
    }
    for name in [DATE, CACHE_CONTROL, EXPIRES, ETAG, LAST_MODIFIED, VARY] {
        if let Some(value) = not_modified.get(&name) {
            cached.headers.insert(name, value.clone());
        }
    }
    cached
}

fn unmodified_since(headers: &HeaderMap, since: Option<SystemTime>) -> bool {
    match (header_time(headers, &LAST_MODIFIED), since) {
        (Some(modified), Some(since)) => modified <= since,
        _ => false,
    }
}

fn is_websocket(headers: &HeaderMap) -> bool {
    headers
        .get(UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
}

fn is_mutation(body: &[u8]) -> bool {
    body.trim_ascii_start().starts_with(MUTATION_PREFIX)
}

fn request_uri(uri: &Uri) -> &str {
    uri.path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path())
}
