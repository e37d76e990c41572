use thiserror::Error;

/// Unified error type for LLM operations
#[derive(Error, Debug)]
pub enum LLMError {
    #[error("network error: {0}")]
    Network(String),

    #[error("api error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("decode error: {0}")]
    Decode(#[from] ConversionError),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("config error: {0}")]
    Config(String),
}

impl LLMError {
    /// Transport failures and non-2xx statuses are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LLMError::Network(_) | LLMError::Api { .. })
    }
}

/// Error while decoding a provider payload
#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing field: {0}")]
    MissingField(String),
}

pub type Result<T> = std::result::Result<T, LLMError>;
