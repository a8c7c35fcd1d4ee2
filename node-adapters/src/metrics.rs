//! Node client metrics

use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter, register_int_gauge,
    CounterVec, HistogramVec, IntCounter, IntGauge,
};

lazy_static::lazy_static! {
    pub static ref NODE_REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "node_requests_total",
        "Total node client requests",
        &["node", "method", "status"]
    )
    .unwrap();

    pub static ref NODE_REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "node_request_duration_seconds",
        "Node client request duration",
        &["node", "method"]
    )
    .unwrap();

    pub static ref CLUSTER_ACTIVE_NODE: IntGauge = register_int_gauge!(
        "cluster_active_node_index",
        "Index of the node currently selected by the liveness cluster"
    )
    .unwrap();

    pub static ref CLUSTER_SWITCHES_TOTAL: IntCounter = register_int_counter!(
        "cluster_switches_total",
        "Active node changes made by the liveness loop"
    )
    .unwrap();

    pub static ref LIVENESS_CHECKS_TOTAL: CounterVec = register_counter_vec!(
        "cluster_liveness_checks_total",
        "Per-node liveness check results",
        &["node", "result"]
    )
    .unwrap();
}
