use thiserror::Error;

/// Application-wide error types for factura.
#[derive(Error, Debug)]
pub enum ExtractError {
    /// Remote service call failed (parse or structuring endpoint).
    #[error("Remote error (HTTP {status_code}): {message}")]
    Remote {
        message: String,
        status_code: u16,
        retryable: bool,
    },

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded")]
    RateLimited,

    /// Network/connection error.
    #[error("Network error: {0}")]
    Network(String),

    /// Document could not be parsed into text.
    #[error("Parse failure: {0}")]
    ParseFailure(String),

    /// Parsed document carried no usable content.
    #[error("Document produced no usable text content")]
    EmptyDocument,

    /// A cache entry or index file is malformed. Treated as a miss.
    #[error("Cache corruption: {0}")]
    CacheCorruption(String),

    /// Checkpoint or artifact write failed. Fatal to the current unit only.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Filesystem operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl ExtractError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExtractError::Network(_) | ExtractError::Timeout(_) | ExtractError::RateLimited => true,
            ExtractError::Remote { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Returns true if the unit should be recorded as an Error-confidence
    /// result rather than surfaced as a batch failure.
    pub fn is_permanent_extraction_failure(&self) -> bool {
        matches!(
            self,
            ExtractError::ParseFailure(_) | ExtractError::EmptyDocument
        )
    }
}
