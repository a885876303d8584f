// Metrics and observability module
// This file handles collection and reporting of admission decisions,
// store health and budget breaker state for the gateway
//
// Numan Thabit 2025 Nov

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter, register_int_gauge,
    CounterVec, Encoder, HistogramVec, IntCounter, IntGauge, TextEncoder,
};

pub static DECISIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "gate_decisions_total",
        "admission decisions by verdict and reason",
        &["verdict", "reason"]
    )
    .expect("register gate_decisions_total")
});

pub static STORE_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "gate_store_latency_seconds",
        "latency for store calls",
        &["store", "op"]
    )
    .expect("register gate_store_latency_seconds")
});

pub static STORE_ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "gate_store_errors_total",
        "store failures and timeouts",
        &["store", "op"]
    )
    .expect("register gate_store_errors_total")
});

pub static QUOTA_UNENFORCED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "gate_quota_unenforced_total",
        "decisions allowed without quota enforcement"
    )
    .expect("register gate_quota_unenforced_total")
});

pub static BUDGET_STATE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "gate_budget_state",
        "budget breaker state (0 normal, 1 warning, 2 emergency)"
    )
    .expect("register gate_budget_state")
});

pub static BUDGET_TRANSITIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "gate_budget_transitions_total",
        "budget breaker state transitions",
        &["from", "to"]
    )
    .expect("register gate_budget_transitions_total")
});

pub static AUTO_BLOCKS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "gate_auto_blocks_total",
        "identities promoted to the blocklist by the spam detector"
    )
    .expect("register gate_auto_blocks_total")
});

/// Render the default registry in the Prometheus text format
pub fn render() -> String {
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(err) = encoder.encode(&prometheus::gather(), &mut buf) {
        tracing::warn!(error = %err, "metrics encoding failed");
    }
    String::from_utf8_lossy(&buf).into_owned()
}
