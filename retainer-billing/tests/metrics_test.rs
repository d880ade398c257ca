//! Split and recombination counters for retainer-billing.
//!
//! Kept in its own test binary so the process-wide registry only sees this scenario.

mod common;

use common::{date, month_end, month_start, TestApp};
use retainer_billing::services::metrics::{ENTRIES_SPLIT_TOTAL, FRAGMENTS_RECOMBINED_TOTAL};
use retainer_billing::BillingError;

fn counters() -> (u64, u64) {
    (ENTRIES_SPLIT_TOTAL.get(), FRAGMENTS_RECOMBINED_TOTAL.get())
}

#[tokio::test]
async fn counters_follow_committed_sessions_only() {
    let app = TestApp::spawn_billing_excess().await;
    let record = app.log(date(2024, 1, 10), 780, "data migration").await;
    let (split_before, merged_before) = counters();

    let document = app.generate_month(2024, 1).await;
    assert_eq!(counters(), (split_before + 1, merged_before));

    // Regeneration merges the two pieces back and splits them again.
    app.generate_month(2024, 1).await;
    assert_eq!(counters(), (split_before + 2, merged_before + 1));

    let err = app.orchestrator.split_entry(record.id, 0).await.unwrap_err();
    assert!(matches!(err, BillingError::InvalidSplitPoint { .. }));
    app.orchestrator.issue(document.invoice.id).await.unwrap();
    let err = app
        .generate(month_start(2024, 1), month_end(2024, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::NotEditable { .. }));
    assert_eq!(counters(), (split_before + 2, merged_before + 1));

    app.orchestrator.void(document.invoice.id).await.unwrap();
    assert_eq!(counters(), (split_before + 2, merged_before + 2));
}
