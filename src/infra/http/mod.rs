mod middleware;

pub use middleware::{RequestId, log_responses, set_request_id};

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware as axum_middleware,
    response::{IntoResponse, Response},
    routing::get,
};

use crate::cache::HttpCache;

use super::proxy::ReverseProxy;

/// State shared by the standalone proxy routes.
#[derive(Clone)]
pub struct ProxyState {
    pub cache: HttpCache,
    pub upstream: ReverseProxy,
}

/// Router for the standalone server: a health probe plus everything else
/// going through the cache to the upstream.
pub fn build_router(state: ProxyState) -> Router {
    Router::new()
        .route("/_health", get(health))
        .fallback(proxy)
        .with_state(state)
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_id))
}

async fn health() -> Response {
    StatusCode::NO_CONTENT.into_response()
}

async fn proxy(State(state): State<ProxyState>, request: Request<Body>) -> Response {
    state.cache.handle(request, state.upstream.clone()).await
}
