//! Unified error handling for flowgate
//!
//! Every failure a request or a configuration change can hit maps onto one
//! of the variants below. Per-request errors never leak into shared state:
//! they are returned as the terminal result of the request that caused them.

use std::fmt;

/// Unified error types for the gateway core
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayError {
    /// Invalid graph description, deployment table or settings.
    /// Raised before activation; the previous topology keeps serving.
    Configuration(String),

    /// A deployment could not be reached after retries were exhausted
    Connection(String),

    /// The request itself is unusable (item-count mismatch, bad payload)
    Request(String),

    /// The caller or a shutdown aborted the request
    Cancellation(String),

    /// Internal invariant violations
    Internal(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Configuration(msg) => write!(f, "Configuration error: {msg}"),
            GatewayError::Connection(msg) => write!(f, "Connection error: {msg}"),
            GatewayError::Request(msg) => write!(f, "Request error: {msg}"),
            GatewayError::Cancellation(msg) => write!(f, "Request cancelled: {msg}"),
            GatewayError::Internal(msg) => write!(f, "Internal error: {msg}"),
        }
    }
}

impl std::error::Error for GatewayError {}

impl GatewayError {
    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Configuration(_) => "configuration",
            GatewayError::Connection(_) => "connection",
            GatewayError::Request(_) => "request",
            GatewayError::Cancellation(_) => "cancellation",
            GatewayError::Internal(_) => "internal",
        }
    }
}

// Error conversions
impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        GatewayError::Configuration(format!("invalid yaml: {err}"))
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Configuration(format!("invalid json: {err}"))
    }
}

impl From<validator::ValidationErrors> for GatewayError {
    fn from(err: validator::ValidationErrors) -> Self {
        GatewayError::Configuration(format!("validation failed: {err}"))
    }
}

/// Result type alias for gateway operations
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Helper trait for adding context to errors
pub trait ErrorContext<T> {
    fn with_context(self, context: &str) -> GatewayResult<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: fmt::Display,
{
    fn with_context(self, context: &str) -> GatewayResult<T> {
        self.map_err(|e| GatewayError::Internal(format!("{context}: {e}")))
    }
}

/// Convenience macros for error creation
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::core::error::GatewayError::Configuration($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::core::error::GatewayError::Configuration(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! request_error {
    ($msg:expr) => {
        $crate::core::error::GatewayError::Request($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::core::error::GatewayError::Request(format!($fmt, $($arg)*))
    };
}
