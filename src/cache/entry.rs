//! Owned response snapshots and their stored representation.

use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header::ETAG},
    response::{IntoResponse, Response},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::error::{OriginError, StorageError};

/// A fully buffered response.
///
/// Snapshots own their headers and body, so cloning one for each coalesced
/// waiter never aliases another request's buffers.
#[derive(Debug, Clone)]
pub struct ResponseSnapshot {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ResponseSnapshot {
    /// Buffers a response body up to `limit` bytes.
    pub async fn capture(response: Response, limit: usize) -> Result<Self, OriginError> {
        let (parts, body) = response.into_parts();
        let body = axum::body::to_bytes(body, limit)
            .await
            .map_err(|err| OriginError::Body(err.to_string()))?;
        Ok(Self {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }

    pub fn etag(&self) -> Option<&str> {
        self.headers.get(ETAG).and_then(|value| value.to_str().ok())
    }

    pub fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }

    /// Headers of this snapshot with an empty body, e.g. for 304 and 412.
    pub fn headers_only(&self, status: StatusCode) -> Response {
        let mut response = status.into_response();
        for (name, value) in &self.headers {
            if name != axum::http::header::CONTENT_LENGTH {
                response.headers_mut().append(name.clone(), value.clone());
            }
        }
        response
    }

    pub fn encode(&self) -> Result<Bytes, StorageError> {
        let stored = StoredEntry {
            status: self.status.as_u16(),
            headers: self
                .headers
                .iter()
                .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
                .collect(),
            body: STANDARD.encode(&self.body),
        };
        serde_json::to_vec(&stored)
            .map(Bytes::from)
            .map_err(|err| StorageError::corrupt(err.to_string()))
    }

    pub fn decode(raw: &[u8]) -> Result<Self, StorageError> {
        let stored: StoredEntry =
            serde_json::from_slice(raw).map_err(|err| StorageError::corrupt(err.to_string()))?;
        let status = StatusCode::from_u16(stored.status)
            .map_err(|err| StorageError::corrupt(err.to_string()))?;
        let mut headers = HeaderMap::new();
        for (name, value) in stored.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                headers.append(name, value);
            }
        }
        let body = STANDARD
            .decode(stored.body.as_bytes())
            .map_err(|err| StorageError::corrupt(err.to_string()))?;
        Ok(Self {
            status,
            headers,
            body: Bytes::from(body),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}
