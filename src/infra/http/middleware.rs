use std::time::Instant;

use axum::{body::Body, http::Request, middleware::Next, response::Response};
use tracing::{error, warn};
use uuid::Uuid;

use crate::cache::CACHE_STATUS;

#[derive(Clone)]
pub struct RequestId(pub String);

pub async fn set_request_id(mut request: Request<Body>, next: Next) -> Response {
    let id = RequestId(Uuid::new_v4().to_string());
    request.extensions_mut().insert(id.clone());

    let mut response = next.run(request).await;
    response.extensions_mut().insert(id);
    response
}

pub async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();

    let response = next.run(request).await;
    let status = response.status();

    if status.is_client_error() || status.is_server_error() {
        let elapsed_ms = start.elapsed().as_millis();
        let cache_status = response
            .headers()
            .get(CACHE_STATUS)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");

        if status.is_server_error() {
            error!(
                target = "cachet::http::response",
                status = status.as_u16(),
                method = %method,
                path = %uri.path(),
                query = uri.query().unwrap_or(""),
                elapsed_ms = elapsed_ms,
                cache_status = cache_status,
                request_id = request_id,
                "request failed",
            );
        } else {
            warn!(
                target = "cachet::http::response",
                status = status.as_u16(),
                method = %method,
                path = %uri.path(),
                query = uri.query().unwrap_or(""),
                elapsed_ms = elapsed_ms,
                cache_status = cache_status,
                request_id = request_id,
                "client request error",
            );
        }
    }

    response
}
