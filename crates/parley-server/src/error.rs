use std::time::Duration;

use parley_gateway::{ConnectionError, ErrorPayload};
use parley_llm::LLMError;
use parley_store::StorageError;
use thiserror::Error;

/// Client-facing error codes
pub mod codes {
    pub const CLIENT_DISCONNECTED: &str = "CLIENT_DISCONNECTED";
    pub const UPSTREAM_REQUEST_FAILED: &str = "UPSTREAM_REQUEST_FAILED";
    pub const UPSTREAM_DECODE_FAILED: &str = "UPSTREAM_DECODE_FAILED";
    pub const PERSISTENCE_FAILED: &str = "PERSISTENCE_FAILED";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const UNAVAILABLE: &str = "SERVICE_UNAVAILABLE";
}

/// Failure of one relayed chat request
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("client disconnected")]
    ClientDisconnected,

    #[error("upstream request failed: {0}")]
    UpstreamRequestFailed(String),

    #[error("upstream response could not be decoded: {0}")]
    UpstreamDecodeFailed(String),

    #[error("persistence failed: {0}")]
    PersistenceFailed(#[from] StorageError),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

impl RelayError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ClientDisconnected => codes::CLIENT_DISCONNECTED,
            Self::UpstreamRequestFailed(_) => codes::UPSTREAM_REQUEST_FAILED,
            Self::UpstreamDecodeFailed(_) => codes::UPSTREAM_DECODE_FAILED,
            Self::PersistenceFailed(_) => codes::PERSISTENCE_FAILED,
            Self::Timeout(_) => codes::TIMEOUT,
        }
    }
}

impl From<LLMError> for RelayError {
    fn from(err: LLMError) -> Self {
        match err {
            LLMError::Decode(e) => Self::UpstreamDecodeFailed(e.to_string()),
            other => Self::UpstreamRequestFailed(other.to_string()),
        }
    }
}

impl From<ConnectionError> for RelayError {
    fn from(_: ConnectionError) -> Self {
        Self::ClientDisconnected
    }
}

impl From<RelayError> for ErrorPayload {
    fn from(err: RelayError) -> Self {
        ErrorPayload::new(err.code(), err.to_string())
    }
}
