//! Prometheus metrics for the sync engine
//!
//! Exposed by the daemon through [`encode_metrics`].

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};

lazy_static! {
    /// Histogram: sweep duration by final status (seconds)
    pub static ref SWEEP_DURATION: HistogramVec = register_histogram_vec!(
        "metagroup_sweep_duration_seconds",
        "Duration of bulk sweeps",
        &["status"],
        vec![0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]
    )
    .expect("Failed to create sweep_duration metric");

    /// Counter: sweeps by status
    pub static ref SWEEPS: CounterVec = register_counter_vec!(
        "metagroup_sweeps_total",
        "Total sweeps by status",
        &["status"]
    )
    .expect("Failed to create sweeps metric");

    /// Counter: applied mutations by kind
    pub static ref MUTATIONS: CounterVec = register_counter_vec!(
        "metagroup_mutations_total",
        "Mutations applied to the roster by kind",
        &["kind"]
    )
    .expect("Failed to create mutations metric");

    /// Counter: units rolled back, by error kind
    pub static ref UNIT_FAILURES: CounterVec = register_counter_vec!(
        "metagroup_unit_failures_total",
        "Units whose mutations were rolled back",
        &["error"]
    )
    .expect("Failed to create unit_failures metric");

    /// Counter: reactor invocations by outcome
    pub static ref REACTIONS: CounterVec = register_counter_vec!(
        "metagroup_reactions_total",
        "Event reactor invocations by outcome",
        &["outcome"]
    )
    .expect("Failed to create reactions metric");

    /// Gauge: daemon health status (1 = healthy, 0 = unhealthy)
    pub static ref HEALTH_STATUS: Gauge = register_gauge!(
        "metagroup_health_status",
        "Daemon health status (1 = healthy, 0 = unhealthy)"
    )
    .expect("Failed to create health_status metric");
}

/// Record a finished sweep
pub fn record_sweep(status: &str, duration_secs: f64) {
    SWEEPS.with_label_values(&[status]).inc();
    SWEEP_DURATION
        .with_label_values(&[status])
        .observe(duration_secs);
}

/// Record one applied mutation
pub fn record_mutation(kind: &str) {
    MUTATIONS.with_label_values(&[kind]).inc();
}

/// Record a rolled-back unit
pub fn record_unit_failure(error_kind: &str) {
    UNIT_FAILURES.with_label_values(&[error_kind]).inc();
}

/// Record a reactor outcome
pub fn record_reaction(outcome: &str) {
    REACTIONS.with_label_values(&[outcome]).inc();
}

/// Set health status
pub fn set_health_status(healthy: bool) {
    HEALTH_STATUS.set(if healthy { 1.0 } else { 0.0 });
}

/// Encode all metrics as Prometheus text format
pub fn encode_metrics() -> crate::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| crate::SyncError::Other(format!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer)
        .map_err(|e| crate::SyncError::Other(format!("Metrics are not UTF-8: {}", e)))
}
