use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, Encoder, IntCounter, IntCounterVec,
    TextEncoder,
};

lazy_static! {
    // One increment per inbound message, labelled done / aborted / failed
    pub static ref EVENTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "serviceradar_compliance_events_total",
        "Inbound events by processing outcome",
        &["outcome"]
    ).unwrap();

    pub static ref EVENT_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "serviceradar_compliance_event_errors_total",
        "Failed events by error kind",
        &["kind"]
    ).unwrap();

    // Messages terminated without retry
    pub static ref DROPPED_MESSAGES_TOTAL: IntCounter = register_int_counter!(
        "serviceradar_compliance_dropped_messages_total",
        "Inbound messages dropped without retry"
    ).unwrap();

    pub static ref FANOUT_PUBLISH_FAILURES_TOTAL: IntCounter = register_int_counter!(
        "serviceradar_compliance_fanout_publish_failures_total",
        "Individual fan-out publishes that failed"
    ).unwrap();

    pub static ref ANCESTRY_UNKNOWN_TOTAL: IntCounter = register_int_counter!(
        "serviceradar_compliance_ancestry_unknown_total",
        "Ancestors whose display name degraded to unknown"
    ).unwrap();

    pub static ref VIOLATIONS_PUBLISHED_TOTAL: IntCounter = register_int_counter!(
        "serviceradar_compliance_violations_published_total",
        "Violation records published"
    ).unwrap();

    pub static ref RECONSTRUCTION_MISSES_TOTAL: IntCounter = register_int_counter!(
        "serviceradar_compliance_reconstruction_misses_total",
        "Deletion events with no matching cache record"
    ).unwrap();
}

pub fn get_metrics_text() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
