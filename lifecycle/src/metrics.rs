//! Life-cycle metrics

#![allow(missing_docs)]

use prometheus::{
    register_counter_vec, register_histogram, register_int_counter, CounterVec, Histogram,
    IntCounter,
};

lazy_static::lazy_static! {
    pub static ref INVOICES_CREATED_TOTAL: CounterVec = register_counter_vec!(
        "hub_invoices_created_total",
        "Invoices created",
        &["type"]
    )
    .unwrap();

    pub static ref INVOICES_SETTLED_TOTAL: CounterVec = register_counter_vec!(
        "hub_invoices_settled_total",
        "Invoices moved to settled",
        &["type"]
    )
    .unwrap();

    pub static ref PAYMENT_OUTCOMES_TOTAL: CounterVec = register_counter_vec!(
        "hub_payment_outcomes_total",
        "Results of pay_invoice",
        &["outcome"]
    )
    .unwrap();

    pub static ref PAYMENT_DURATION: Histogram = register_histogram!(
        "hub_payment_duration_seconds",
        "Time spent in pay_exact"
    )
    .unwrap();

    pub static ref RECONCILE_ACTIONS_TOTAL: CounterVec = register_counter_vec!(
        "hub_reconcile_actions_total",
        "Reconciliation decisions per pending invoice",
        &["action"]
    )
    .unwrap();

    pub static ref SUBSCRIPTION_RESTARTS_TOTAL: IntCounter = register_int_counter!(
        "hub_subscription_restarts_total",
        "Supervised restarts of the invoice settlement stream"
    )
    .unwrap();

    pub static ref EVENTS_PUBLISHED_TOTAL: CounterVec = register_counter_vec!(
        "hub_events_published_total",
        "Invoice events handed to the broker",
        &["topic"]
    )
    .unwrap();
}
