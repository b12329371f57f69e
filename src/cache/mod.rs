//! Cachet HTTP cache engine
//!
//! An RFC 7234 shared cache that sits in front of an origin, either as axum
//! middleware or behind the standalone reverse proxy:
//!
//! - **Keys**: derived from method, scheme, host, path, query, body digest and
//!   configured headers, with per-route overrides
//! - **Storage**: pluggable [`Storer`]s written in parallel, each holding a
//!   fresh entry, a stale shadow and a vary index per key
//! - **Coalescing**: concurrent misses for one key share one origin call
//! - **Surrogate tags**: responses declare tags, purging a tag evicts every
//!   key it covers and notifies the configured CDN
//!
//! ## Configuration
//!
//! Controlled by the `[cache]` table of `cachet.toml`:
//!
//! ```toml
//! [cache]
//! cache_name = "Cachet"
//! ttl_secs = 120
//! stale_secs = 30
//! # ... see config.rs for all options
//! ```

mod api;
mod coalescing;
mod config;
mod context;
mod directives;
mod entry;
mod error;
mod fanout;
mod freshness;
mod keys;
mod lock;
mod middleware;
mod orchestrator;
mod origin;
mod status;
mod storer;
mod surrogate;
mod validator;
mod vary;

pub use coalescing::Coalescer;
pub use config::{
    ApiConfig, CacheConfig, CacheMode, CdnConfig, CdnProvider, KeyFlags, KeyOverride,
    PurgeStrategy, RouteRule,
};
pub use context::{RequestContext, RequestParts};
pub use directives::{DirectiveError, MaxStale, RequestDirectives, ResponseDirectives};
pub use entry::ResponseSnapshot;
pub use error::{BuildError, CoalesceError, OriginError, StorageError};
pub use fanout::{Lookup, StorageFanout, StoreOutcome};
pub use freshness::{SkipReason, Storability, StoragePlan};
pub use keys::{DerivedKey, KeyDeriver, KeyRequest, body_digest};
pub use middleware::{NextOrigin, http_cache_layer};
pub use orchestrator::HttpCache;
pub use origin::Origin;
pub use status::{CACHE_STATUS, CacheStatus};
pub use storer::{MemoryStorer, MultiLevel, STALE_PREFIX, Storer, VariantWrite};
pub use surrogate::{
    Akamai, Cloudflare, Fastly, GROUP_INVALIDATION, Generic, PurgeRequest, SurrogateIndex,
    SurrogateProvider,
};
pub use validator::Revalidator;
pub use vary::Vary;
