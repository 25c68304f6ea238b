//! Core traits for flowgate components
//!
//! These seams decouple the node executor from the connection pool and the
//! connection pool from the wire.

use std::{fmt, time::Duration};

use async_trait::async_trait;

use super::{error::GatewayResult, request::DataRequest};

/// Sends a payload to a named deployment and returns its response.
///
/// Implemented by the connection pool; the node executor only sees this.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn send(
        &self,
        deployment: &str,
        request: DataRequest,
        endpoint: &str,
        timeout: Duration,
    ) -> GatewayResult<DataRequest>;
}

/// A single call to one replica, as seen by the connection pool.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Performs one call against `address`; no retries at this level.
    async fn call(
        &self,
        address: &str,
        endpoint: &str,
        request: DataRequest,
    ) -> Result<DataRequest, TransportError>;

    /// Returns true when `address` accepts connections within `timeout`.
    async fn is_reachable(&self, address: &str, timeout: Duration) -> bool;

    /// Releases any connections held by the transport.
    async fn close(&self) {}
}

/// Failure of a single replica call.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    /// Replica refused or dropped the connection
    Unavailable(String),
    /// The call did not finish in time
    Timeout(String),
    /// Replica answered with a non-success status
    Status(u16, String),
    /// Replica answered with something that is not a payload
    Malformed(String),
}

impl TransportError {
    /// Transient failures are retried against the next replica.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Unavailable(_) | TransportError::Timeout(_) => true,
            TransportError::Status(code, _) => {
                matches!(code, 408 | 429 | 500 | 502 | 503 | 504)
            }
            TransportError::Malformed(_) => false,
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Unavailable(msg) => write!(f, "unavailable: {msg}"),
            TransportError::Timeout(msg) => write!(f, "timed out: {msg}"),
            TransportError::Status(code, msg) => write!(f, "status {code}: {msg}"),
            TransportError::Malformed(msg) => write!(f, "malformed response: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}
