//! Request orchestration layer
//!
//! Runs requests over the compiled topology: join slots and node tasks per
//! request, merge-reduce at joins, the streamer adapters submit to, and the
//! runtime that owns the pool and the active topology.

pub mod executor;
pub mod lifecycle;
pub mod merge;
pub mod streamer;


pub use lifecycle::GatewayRuntime;
pub use merge::merge_reduce;
pub use streamer::{RequestStreamer, ResponseHandle};
