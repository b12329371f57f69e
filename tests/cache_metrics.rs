use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode},
    middleware,
    routing::get,
};
use bytes::Bytes;
use cachet::cache::{
    CacheConfig, HttpCache, MemoryStorer, StorageError, Storer, http_cache_layer,
};
use metrics_util::debugging::DebuggingRecorder;
use regex::Regex;
use tower::ServiceExt;

/// Storer that rejects every operation.
struct Unavailable;

#[async_trait]
impl Storer for Unavailable {
    fn name(&self) -> &str {
        "UNAVAILABLE"
    }

    async fn get(&self, _key: &str) -> Result<Option<Bytes>, StorageError> {
        Err(StorageError::backend("UNAVAILABLE", "connection refused"))
    }

    async fn set(&self, _key: &str, _value: Bytes, _ttl: Duration) -> Result<(), StorageError> {
        Err(StorageError::backend("UNAVAILABLE", "connection refused"))
    }

    async fn delete(&self, _key: &str) -> Result<(), StorageError> {
        Err(StorageError::backend("UNAVAILABLE", "connection refused"))
    }

    async fn delete_many(&self, _pattern: &Regex) -> Result<usize, StorageError> {
        Err(StorageError::backend("UNAVAILABLE", "connection refused"))
    }

    async fn list_keys(&self) -> Result<Vec<String>, StorageError> {
        Err(StorageError::backend("UNAVAILABLE", "connection refused"))
    }

    async fn reset(&self) -> Result<(), StorageError> {
        Err(StorageError::backend("UNAVAILABLE", "connection refused"))
    }
}

fn app(cache: HttpCache, calls: Arc<AtomicUsize>) -> Router {
    Router::new()
        .route(
            "/{*path}",
            get(move || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    ([("cache-control", "max-age=1")], "payload")
                }
            }),
        )
        .layer(middleware::from_fn_with_state(cache, http_cache_layer))
}

async fn get_ok(app: &Router, uri: &str, cache_control: Option<&str>) {
    let mut builder = Request::builder().method(Method::GET).uri(uri);
    if let Some(value) = cache_control {
        builder = builder.header("cache-control", value);
    }
    let request = builder.body(Body::empty()).expect("request should build");
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("router should respond");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");
    cachet::infra::telemetry::describe_metrics();

    // Miss, hit, stale serve and write failure through a two-level fan-out.
    let config = CacheConfig {
        stale_secs: 30,
        ..Default::default()
    };
    let memory: Arc<dyn Storer> = Arc::new(MemoryStorer::new(&config));
    let failing: Arc<dyn Storer> = Arc::new(Unavailable);
    let cache = HttpCache::new(config, vec![failing, memory]).expect("cache should build");
    let calls = Arc::new(AtomicUsize::new(0));
    let fanout = app(cache, Arc::clone(&calls));

    get_ok(&fanout, "/posts/one", None).await;
    get_ok(&fanout, "/posts/one", None).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(2100)).await;
    get_ok(&fanout, "/posts/one", Some("max-stale=10")).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Capacity evictions in the memory storer.
    let tiny = CacheConfig {
        memory_capacity: 1,
        ..Default::default()
    };
    let cache = HttpCache::new(tiny, Vec::new()).expect("cache should build");
    let evicting = app(cache, Arc::new(AtomicUsize::new(0)));
    for uri in ["/tags/one", "/tags/two"] {
        get_ok(&evicting, uri, None).await;
    }

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "cachet_cache_miss_total",
        "cachet_cache_hit_total",
        "cachet_cache_stale_total",
        "cachet_store_failure_total",
        "cachet_storage_evict_total",
        "cachet_origin_fetch_ms",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
