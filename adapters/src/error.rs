//! Error types for the adapter execution core

use thiserror::Error;

/// Result type for adapter operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error classification used by retry and budget accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorClass {
    /// Operation deadline elapsed
    Timeout,
    /// Connection-level failure (reset, refused, dropped)
    Connection,
    /// Remote system signalled a transient server-side fault
    Server,
    /// Rate limit gate rejected the call
    RateLimited,
    /// No pooled connection became available in time
    PoolExhausted,
    /// Authentication or authorization failure
    Auth,
    /// Payload rejected as malformed by the remote system
    Malformed,
    /// Retry budget used up
    Exhausted,
    /// Error budget crossed its threshold
    Budget,
    /// Anything else
    Other,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorClass::Timeout => "timeout",
            ErrorClass::Connection => "connection",
            ErrorClass::Server => "server",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::PoolExhausted => "pool_exhausted",
            ErrorClass::Auth => "auth",
            ErrorClass::Malformed => "malformed",
            ErrorClass::Exhausted => "exhausted",
            ErrorClass::Budget => "budget",
            ErrorClass::Other => "other",
        };
        write!(f, "{}", s)
    }
}

/// Adapter errors
#[derive(Error, Debug)]
pub enum Error {
    /// Config value present but not coercible to the declared type
    #[error("Config type mismatch for '{key}': expected {expected}, got {value}")]
    ConfigTypeMismatch {
        /// Option key
        key: String,
        /// Declared type
        expected: &'static str,
        /// Offending value
        value: String,
    },

    /// Transient transport failure (timeout, reset, 5xx-style)
    #[error("Retryable transport error: {0}")]
    TransportRetryable(String),

    /// Permanent transport failure (malformed payload, protocol violation)
    #[error("Fatal transport error: {0}")]
    TransportFatal(String),

    /// Authentication rejected by the remote system
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Operation deadline elapsed
    #[error("Timeout after {seconds}s: {operation}")]
    Timeout {
        /// Timeout duration
        seconds: u64,
        /// Operation
        operation: String,
    },

    /// No pooled connection became available within the acquire timeout
    #[error("Connection pool exhausted after waiting {waited_ms}ms")]
    PoolExhausted {
        /// Time spent waiting
        waited_ms: u64,
    },

    /// Rate limiter deadline elapsed before a token became available
    #[error("Rate limited: no token within {waited_ms}ms")]
    RateLimited {
        /// Time spent waiting
        waited_ms: u64,
    },

    /// Retry budget used up
    #[error("Retry exhausted after {attempts} attempts: {last_error}")]
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// Last error
        last_error: String,
    },

    /// Error budget crossed its threshold; instance disabled
    #[error(
        "Error budget exceeded for adapter {adapter_id}: {failures} failures in {window_secs}s window"
    )]
    ErrorBudgetExceeded {
        /// Adapter instance ID
        adapter_id: String,
        /// Failures counted in the window
        failures: u64,
        /// Window length
        window_secs: u64,
    },

    /// Operation refused because the instance is disabled
    #[error("Adapter {adapter_id} is disabled: {reason}")]
    AdapterDisabled {
        /// Adapter instance ID
        adapter_id: String,
        /// Reason recorded at disable time
        reason: String,
    },

    /// Cursor advance would move backward
    #[error("Cursor regression for adapter {adapter_id}: {current} -> {proposed}")]
    CursorRegression {
        /// Adapter instance ID
        adapter_id: String,
        /// Current cursor position
        current: String,
        /// Rejected position
        proposed: String,
    },

    /// Dead-letter sink at capacity
    #[error("Dead letter sink full: {current}/{max} entries")]
    DeadLetterFull {
        /// Current size
        current: usize,
        /// Max size
        max: usize,
    },

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error
    #[error("Adapter error: {0}")]
    Generic(String),
}

impl Error {
    /// Whether the caller's retry policy may retry this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TransportRetryable(_)
                | Error::Timeout { .. }
                | Error::PoolExhausted { .. }
                | Error::RateLimited { .. }
        )
    }

    /// Classify for budget accounting and health reporting
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Timeout { .. } => ErrorClass::Timeout,
            Error::TransportRetryable(_) => ErrorClass::Server,
            Error::TransportFatal(_) => ErrorClass::Malformed,
            Error::Auth(_) => ErrorClass::Auth,
            Error::PoolExhausted { .. } => ErrorClass::PoolExhausted,
            Error::RateLimited { .. } => ErrorClass::RateLimited,
            Error::Exhausted { .. } => ErrorClass::Exhausted,
            Error::ErrorBudgetExceeded { .. } | Error::AdapterDisabled { .. } => ErrorClass::Budget,
            Error::ConfigTypeMismatch { .. }
            | Error::CursorRegression { .. }
            | Error::DeadLetterFull { .. }
            | Error::Json(_)
            | Error::Generic(_) => ErrorClass::Other,
        }
    }
}
