//! Axum adapter: runs every request through the cache before the wrapped
//! router.
//!
//! ```ignore
//! let app = Router::new()
//!     .route("/", get(index))
//!     .layer(middleware::from_fn_with_state(cache.clone(), http_cache_layer));
//! ```

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::Response,
};

use super::error::OriginError;
use super::orchestrator::HttpCache;
use super::origin::Origin;

/// The rest of the middleware stack, seen as an origin.
#[derive(Clone)]
pub struct NextOrigin(pub Next);

#[async_trait]
impl Origin for NextOrigin {
    async fn forward(self, request: Request<Body>) -> Result<Response, OriginError> {
        Ok(self.0.run(request).await)
    }
}

pub async fn http_cache_layer(
    State(cache): State<HttpCache>,
    request: Request<Body>,
    next: Next,
) -> Response {
    cache.handle(request, NextOrigin(next)).await
}
