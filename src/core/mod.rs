//! Core abstractions for flowgate
//!
//! Error taxonomy, payload types, the traits that separate the executor from
//! the pool and the pool from the wire, and shared metrics.

pub mod error;
pub mod metrics;
pub mod request;
pub mod traits;


// Re-export commonly used types
pub use error::{ErrorContext, GatewayError, GatewayResult};
pub use request::{DataRequest, Document, SCHEMA_VERSION};
pub use traits::{Dispatcher, Transport, TransportError};
