//! Prometheus metrics for message bus

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter, register_int_gauge,
    CounterVec, HistogramVec, IntCounter, IntGauge,
};

lazy_static! {
    /// Total messages published
    pub static ref MESSAGE_PUBLISH_TOTAL: CounterVec = register_counter_vec!(
        "message_bus_publish_total",
        "Total messages published",
        &["exchange", "status"]
    )
    .unwrap();

    /// Message publish duration
    pub static ref MESSAGE_PUBLISH_DURATION: HistogramVec = register_histogram_vec!(
        "message_bus_publish_duration_seconds",
        "Message publish duration in seconds",
        &["exchange"]
    )
    .unwrap();

    /// Total messages received
    pub static ref MESSAGE_RECEIVE_TOTAL: CounterVec = register_counter_vec!(
        "message_bus_receive_total",
        "Total messages received",
        &["queue"]
    )
    .unwrap();

    /// Message handling duration
    pub static ref MESSAGE_PROCESS_DURATION: HistogramVec = register_histogram_vec!(
        "message_bus_process_duration_seconds",
        "Message handler duration in seconds",
        &["queue"]
    )
    .unwrap();

    /// Acknowledgments by outcome
    pub static ref ACK_TOTAL: CounterVec = register_counter_vec!(
        "message_bus_ack_total",
        "Delivery settlements by outcome",
        &["outcome"]
    )
    .unwrap();

    /// Connection status transitions
    pub static ref CONNECTION_STATUS: CounterVec = register_counter_vec!(
        "message_bus_connection_status",
        "Broker connection status (connected/disconnected)",
        &["status"]
    )
    .unwrap();

    /// Reconnect attempts
    pub static ref RECONNECT_ATTEMPTS: IntCounter = register_int_counter!(
        "message_bus_reconnect_attempts_total",
        "Broker reconnect attempts"
    )
    .unwrap();

    /// Idle sessions held by the pool
    pub static ref POOL_IDLE_SESSIONS: IntGauge = register_int_gauge!(
        "message_bus_pool_idle_sessions",
        "Idle sessions held by the session pool"
    )
    .unwrap();
}
