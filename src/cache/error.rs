use thiserror::Error;

/// Failure reported by a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend `{backend}` failed: {message}")]
    Backend { backend: String, message: String },
    #[error("stored entry could not be decoded: {0}")]
    Corrupt(String),
    #[error("storage backend `{0}` timed out")]
    Timeout(String),
}

impl StorageError {
    pub fn backend(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            backend: backend.into(),
            message: message.into(),
        }
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt(message.into())
    }
}

/// Failure talking to the origin. Cloneable so one outcome can be handed to
/// every coalesced waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OriginError {
    #[error("origin request failed: {0}")]
    Transport(String),
    #[error("origin response body could not be buffered: {0}")]
    Body(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoalesceError {
    #[error("in-flight work for `{key}` ended without publishing a result")]
    Abandoned { key: String },
}

/// Invalid cache configuration detected while assembling the engine.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("invalid pattern in `{field}`: {source}")]
    Pattern {
        field: &'static str,
        #[source]
        source: regex::Error,
    },
    #[error("invalid cdn configuration: {0}")]
    Cdn(String),
}

impl BuildError {
    pub fn pattern(field: &'static str, source: regex::Error) -> Self {
        Self::Pattern { field, source }
    }
}
