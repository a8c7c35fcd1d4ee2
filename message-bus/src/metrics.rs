//! Prometheus metrics for message bus

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_gauge, CounterVec, HistogramVec,
    IntGauge,
};

lazy_static! {
    /// Events handed to subscribers, by outcome
    pub static ref BROKER_DELIVERIES_TOTAL: CounterVec = register_counter_vec!(
        "message_bus_deliveries_total",
        "Per-subscriber delivery attempts by outcome (delivered/dropped/removed)",
        &["outcome"]
    )
    .unwrap();

    /// Current subscriber count
    pub static ref BROKER_SUBSCRIBERS: IntGauge = register_int_gauge!(
        "message_bus_subscribers",
        "Registered subscribers across all topics"
    )
    .unwrap();

    /// Events forwarded to external sinks
    pub static ref FORWARD_TOTAL: CounterVec = register_counter_vec!(
        "message_bus_forward_total",
        "Events forwarded to external sinks",
        &["sink", "status"]
    )
    .unwrap();

    /// Forwarding duration (including retries)
    pub static ref FORWARD_DURATION: HistogramVec = register_histogram_vec!(
        "message_bus_forward_duration_seconds",
        "Time to forward one event to an external sink",
        &["sink"]
    )
    .unwrap();
}
