//! This crate contains the request-routing core of the flowgate serving gateway.
//!
//! It compiles a graph of deployments into an immutable topology, executes
//! every request over that graph with per-node join semantics, and reaches
//! the deployments through a load-balancing, retrying connection pool.

pub mod config;
pub mod core;
pub mod logging;
pub mod orchestration;
pub mod pool;
pub mod topology;

pub use crate::core::{DataRequest, Document, GatewayError, GatewayResult};
pub use orchestration::{GatewayRuntime, RequestStreamer, ResponseHandle};
