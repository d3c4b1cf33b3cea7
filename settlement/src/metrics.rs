//! Prometheus metrics for the settlement pipeline

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter,
    register_int_gauge_vec, CounterVec, HistogramVec, IntCounter, IntGaugeVec,
};

lazy_static! {
    /// Consumer events by outcome
    pub static ref CONSUMER_EVENTS_TOTAL: CounterVec = register_counter_vec!(
        "settlement_consumer_events_total",
        "Events seen by settlement consumers, by outcome",
        &["consumer", "outcome"]
    )
    .unwrap();

    /// Per-item processing duration
    pub static ref PROCESSING_DURATION: HistogramVec = register_histogram_vec!(
        "settlement_processing_duration_seconds",
        "Time spent applying one event",
        &["consumer"]
    )
    .unwrap();

    /// Items waiting in retry stores
    pub static ref RETRY_STORE_SIZE: IntGaugeVec = register_int_gauge_vec!(
        "settlement_retry_store_size",
        "Items waiting in the retry store",
        &["consumer"]
    )
    .unwrap();

    /// Discrepancies recorded by reconciliation
    pub static ref DISCREPANCIES_TOTAL: IntCounter = register_int_counter!(
        "settlement_discrepancies_total",
        "Balance discrepancies recorded"
    )
    .unwrap();

    /// Price alerts by level
    pub static ref PRICE_ALERTS_TOTAL: CounterVec = register_counter_vec!(
        "settlement_price_alerts_total",
        "Price change alerts raised",
        &["level"]
    )
    .unwrap();
}

/// Bump the outcome counter for a consumer
pub fn record(consumer: &str, outcome: &str) {
    CONSUMER_EVENTS_TOTAL
        .with_label_values(&[consumer, outcome])
        .inc();
}
