//! Adapter metrics

use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_gauge_vec, CounterVec,
    HistogramVec, IntGaugeVec,
};

lazy_static::lazy_static! {
    pub static ref ADAPTER_FETCHES_TOTAL: CounterVec = register_counter_vec!(
        "adapter_fetches_total",
        "Inbound fetch operations",
        &["adapter_id", "outcome"]
    )
    .unwrap();

    pub static ref ADAPTER_DELIVERIES_TOTAL: CounterVec = register_counter_vec!(
        "adapter_deliveries_total",
        "Outbound delivery commits",
        &["adapter_id", "outcome"]
    )
    .unwrap();

    pub static ref ADAPTER_OPERATION_DURATION: HistogramVec = register_histogram_vec!(
        "adapter_operation_duration_seconds",
        "Transport operation duration",
        &["adapter_id", "operation"]
    )
    .unwrap();

    pub static ref ADAPTER_RECORDS_DEDUPED_TOTAL: CounterVec = register_counter_vec!(
        "adapter_records_deduped_total",
        "Records suppressed by duplicate detection",
        &["adapter_id"]
    )
    .unwrap();

    pub static ref ADAPTER_DEAD_LETTER_DEPTH: IntGaugeVec = register_int_gauge_vec!(
        "adapter_dead_letter_depth",
        "Dead-letter entries pending per adapter",
        &["adapter_id"]
    )
    .unwrap();

    pub static ref ADAPTER_STATUS: IntGaugeVec = register_int_gauge_vec!(
        "adapter_status",
        "Adapter status (0=running, 1=backoff, 2=disabled)",
        &["adapter_id"]
    )
    .unwrap();
}
