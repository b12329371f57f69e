use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Registers metric descriptions once; safe to call repeatedly.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "cachet_cache_hit_total",
            Unit::Count,
            "Total number of responses served from a fresh entry."
        );
        describe_counter!(
            "cachet_cache_miss_total",
            Unit::Count,
            "Total number of requests forwarded because no servable entry existed."
        );
        describe_counter!(
            "cachet_cache_stale_total",
            Unit::Count,
            "Total number of responses served from a stale shadow."
        );
        describe_counter!(
            "cachet_coalesced_total",
            Unit::Count,
            "Total number of requests that joined another request's origin call."
        );
        describe_counter!(
            "cachet_store_failure_total",
            Unit::Count,
            "Total number of rejected storage writes, per storer."
        );
        describe_counter!(
            "cachet_storage_evict_total",
            Unit::Count,
            "Total number of in-memory evictions due to capacity."
        );
        describe_histogram!(
            "cachet_origin_fetch_ms",
            Unit::Milliseconds,
            "Origin round trip latency in milliseconds."
        );
    });
}
