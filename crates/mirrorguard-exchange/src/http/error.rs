/*
[INPUT]:  Error sources (HTTP, API envelope, serialization, signing)
[OUTPUT]: Structured error types with retry classification
[POS]:    Error handling layer - unified error types for entire crate
[UPDATE]: When adding new error sources or extending the ret-code table
*/

use thiserror::Error;

/// Timestamp outside the server's receive window.
pub const RET_TIMESTAMP_DRIFT: i64 = 10_002;
/// Too many requests.
pub const RET_RATE_LIMIT: i64 = 10_006;
/// Internal server error / matching engine busy.
pub const RET_SERVER_BUSY: i64 = 10_016;
/// Margin temporarily unavailable (settlement in progress).
pub const RET_MARGIN_UNAVAILABLE: i64 = 110_007;
/// Order is being processed, try again shortly.
pub const RET_ORDER_PENDING: i64 = 110_079;

/// Request parameter error.
pub const RET_BAD_PARAM: i64 = 10_001;
/// Invalid price or quantity for the instrument.
pub const RET_QTY_INVALID: i64 = 110_003;
/// Reduce-only rule violated.
pub const RET_REDUCE_ONLY_VIOLATION: i64 = 110_017;
/// Order does not exist or is already finished.
pub const RET_ORDER_NOT_FOUND: i64 = 110_001;
/// Duplicate client order link id.
pub const RET_DUPLICATE_LINK_ID: i64 = 110_072;

/// Retry classification consumed by the engine's resilience layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transient failure; the call may be retried.
    Retryable,
    /// Business-rule or parameter failure; retrying cannot succeed.
    Fatal,
}

/// Main error type for the exchange adapter
#[derive(Error, Debug)]
pub enum ExchangeError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// API envelope returned a non-zero ret code
    #[error("API error (code {code}): {message}")]
    Api { code: i64, message: String },

    /// Request signing failed
    #[error("Request signing failed: {message}")]
    Signing { message: String },

    /// Credentials missing for an authenticated endpoint
    #[error("Missing credentials for authenticated endpoint {endpoint}")]
    MissingCredentials { endpoint: String },

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// URL parsing failed
    #[error("Invalid URL: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Invalid response from server
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rate limit exceeded
    #[error("Rate limit exceeded, retry after {retry_after}s")]
    RateLimit { retry_after: u64 },

    /// Connection timeout
    #[error("Connection timeout after {duration}s")]
    Timeout { duration: u64 },
}

impl ExchangeError {
    /// Classify the error for the retry wrapper.
    ///
    /// Network-level failures are always retryable. Envelope errors are
    /// classified by a fixed ret-code table; unknown codes are fatal so a
    /// new business rejection is never hammered blindly.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExchangeError::Http(_)
            | ExchangeError::RateLimit { .. }
            | ExchangeError::Timeout { .. }
            | ExchangeError::InvalidResponse(_) => ErrorKind::Retryable,
            ExchangeError::Api { code, .. } => classify_ret_code(*code),
            ExchangeError::Signing { .. }
            | ExchangeError::MissingCredentials { .. }
            | ExchangeError::Serialization(_)
            | ExchangeError::UrlParse(_)
            | ExchangeError::Config(_) => ErrorKind::Fatal,
        }
    }

    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Retryable
    }
}

fn classify_ret_code(code: i64) -> ErrorKind {
    match code {
        RET_TIMESTAMP_DRIFT
        | RET_RATE_LIMIT
        | RET_SERVER_BUSY
        | RET_MARGIN_UNAVAILABLE
        | RET_ORDER_PENDING => ErrorKind::Retryable,
        _ => ErrorKind::Fatal,
    }
}

/// Result type alias for exchange operations
pub type Result<T> = std::result::Result<T, ExchangeError>;
