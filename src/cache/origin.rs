use async_trait::async_trait;
use axum::{body::Body, http::Request, response::Response};

use super::error::OriginError;

/// Whatever sits behind the cache: the wrapped router, a reverse proxy, a
/// test double. Taken by value so one handle can be cloned into detached
/// background revalidations.
#[async_trait]
pub trait Origin: Clone + Send + 'static {
    async fn forward(self, request: Request<Body>) -> Result<Response, OriginError>;
}
