//! Prometheus metrics for the gateway core.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter_vec, register_int_gauge, Histogram,
    HistogramOpts, IntCounterVec, IntGauge,
};

const LATENCY_BUCKETS: &[f64] = &[
    1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 2000.0, 5000.0, 10000.0, 30000.0,
    60000.0,
];

// Requests by terminal outcome ("ok" or an error kind)
pub static REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "flowgate_requests_total",
        "Requests resolved by the gateway, by outcome",
        &["outcome"]
    )
    .expect("Failed to register prometheus metric: flowgate_requests_total")
});

pub static REQUEST_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "flowgate_request_latency_ms",
        "Time from dispatch until the end-gateway resolves, in milliseconds",
    )
    .buckets(LATENCY_BUCKETS.to_vec());
    register_histogram!(opts)
        .expect("Failed to register prometheus metric: flowgate_request_latency_ms")
});

pub static REQUESTS_IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "flowgate_requests_in_flight",
        "Requests whose node tasks have not drained yet"
    )
    .expect("Failed to register prometheus metric: flowgate_requests_in_flight")
});

pub static NODE_DISPATCHES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "flowgate_node_dispatch_total",
        "Node tasks scheduled after their join completed",
        &["node"]
    )
    .expect("Failed to register prometheus metric: flowgate_node_dispatch_total")
});

pub static POOL_ATTEMPTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "flowgate_pool_attempts_total",
        "Replica calls issued by the connection pool",
        &["deployment", "outcome"]
    )
    .expect("Failed to register prometheus metric: flowgate_pool_attempts_total")
});

pub static REPLICA_UNHEALTHY: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "flowgate_pool_replica_unhealthy_total",
        "Replicas marked unhealthy after retries were exhausted",
        &["deployment"]
    )
    .expect("Failed to register prometheus metric: flowgate_pool_replica_unhealthy_total")
});
