//! Prometheus metrics for retainer billing.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter, CounterVec,
    HistogramVec, IntCounter, TextEncoder,
};

/// Invoice generation attempts by outcome (created, regenerated, rejected).
pub static INVOICES_GENERATED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "billing_invoices_generated_total",
        "Total number of invoice generation runs by outcome",
        &["outcome"]
    )
    .expect("Failed to register invoices_generated_total")
});

/// Status transitions by action.
pub static INVOICE_TRANSITIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "billing_invoice_transitions_total",
        "Total number of invoice status transitions by action",
        &["action"] // issue, mark_paid, void, unvoid
    )
    .expect("Failed to register invoice_transitions_total")
});

pub static ENTRIES_SPLIT_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "billing_entries_split_total",
        "Total number of time records split at a pool boundary"
    )
    .expect("Failed to register entries_split_total")
});

pub static FRAGMENTS_RECOMBINED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "billing_fragments_recombined_total",
        "Total number of fragment records eliminated by recombination"
    )
    .expect("Failed to register fragments_recombined_total")
});

/// Error counter for alerting.
pub static ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "billing_errors_total",
        "Total number of errors by type",
        &["error_type"]
    )
    .expect("Failed to register errors_total")
});

/// Database query duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "billing_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register db_query_duration")
});

/// Split and merge counts gathered inside a store session.
///
/// Published only once the session has committed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionTally {
    pub entries_split: u64,
    pub fragments_recombined: u64,
}

impl SessionTally {
    pub fn publish(self) {
        if self.entries_split > 0 {
            ENTRIES_SPLIT_TOTAL.inc_by(self.entries_split);
        }
        if self.fragments_recombined > 0 {
            FRAGMENTS_RECOMBINED_TOTAL.inc_by(self.fragments_recombined);
        }
    }
}

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&INVOICES_GENERATED_TOTAL);
    Lazy::force(&INVOICE_TRANSITIONS_TOTAL);
    Lazy::force(&ENTRIES_SPLIT_TOTAL);
    Lazy::force(&FRAGMENTS_RECOMBINED_TOTAL);
    Lazy::force(&ERRORS_TOTAL);
    Lazy::force(&DB_QUERY_DURATION);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
