//! Entry splitting and fragment recombination tests for retainer-billing.

mod common;

use common::{date, TestApp, TEST_COMPANY_ID, TEST_PROJECT_ID, TEST_USER_ID};
use retainer_billing::models::NewTimeRecord;
use retainer_billing::BillingError;

#[tokio::test]
async fn split_point_must_fall_inside_the_record() {
    let app = TestApp::spawn().await;
    let record = app.log(date(2024, 1, 4), 90, "pairing").await;

    for split_at in [0, -5, 90, 120] {
        let err = app
            .orchestrator
            .split_entry(record.id, split_at)
            .await
            .unwrap_err();
        assert!(
            matches!(err, BillingError::InvalidSplitPoint { record_id, minutes_worked: 90, .. } if record_id == record.id),
            "split at {} should be rejected",
            split_at
        );
    }
    assert_eq!(app.records().await.len(), 1);
}

#[tokio::test]
async fn split_conserves_minutes_and_leaves_overflow_unlinked() {
    let app = TestApp::spawn().await;
    let record = app.log(date(2024, 1, 4), 90, "pairing").await;

    let (primary, overflow) = app.orchestrator.split_entry(record.id, 35).await.unwrap();

    assert_eq!(primary.id, record.id);
    assert_eq!(primary.minutes_worked, 35);
    assert_eq!(overflow.minutes_worked, 55);
    assert!(!overflow.is_linked());
    assert_eq!(overflow.merge_key(), record.merge_key());
    assert_eq!(app.total_minutes().await, 90);
}

#[tokio::test]
async fn missing_record_cannot_be_split() {
    let app = TestApp::spawn().await;
    let err = app.orchestrator.split_entry(424_242, 10).await.unwrap_err();
    assert!(matches!(err, BillingError::NotFound(_)));
}

#[tokio::test]
async fn unlinked_fragments_merge_into_lowest_id() {
    let app = TestApp::spawn().await;
    let record = app.log(date(2024, 1, 4), 120, "pairing").await;
    let (_, overflow) = app.orchestrator.split_entry(record.id, 30).await.unwrap();
    app.orchestrator.split_entry(overflow.id, 45).await.unwrap();
    assert_eq!(app.records().await.len(), 3);

    let eliminated = app
        .orchestrator
        .recombine_unlinked_fragments(common::TEST_COMPANY_ID)
        .await
        .unwrap();

    assert_eq!(eliminated, 2);
    let records = app.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, record.id);
    assert_eq!(records[0].minutes_worked, 120);
}

#[tokio::test]
async fn group_with_a_linked_sibling_is_left_alone() {
    let app = TestApp::spawn().await;
    let record = app.log(date(2024, 1, 4), 120, "pairing").await;
    app.generate_month(2024, 1).await;

    // The primary stays linked; both overflow pieces are unlinked.
    let (_, overflow) = app.orchestrator.split_entry(record.id, 60).await.unwrap();
    app.orchestrator.split_entry(overflow.id, 30).await.unwrap();

    let eliminated = app
        .orchestrator
        .recombine_unlinked_fragments(common::TEST_COMPANY_ID)
        .await
        .unwrap();

    assert_eq!(eliminated, 0);
    assert_eq!(app.records().await.len(), 3);
    assert_eq!(app.total_minutes().await, 120);
}

#[tokio::test]
async fn distinct_work_items_are_not_merged() {
    let app = TestApp::spawn().await;
    app.log(date(2024, 1, 4), 60, "pairing").await;
    app.log(date(2024, 1, 4), 60, "code review").await;
    app.log(date(2024, 1, 5), 60, "pairing").await;

    let eliminated = app
        .orchestrator
        .recombine_unlinked_fragments(common::TEST_COMPANY_ID)
        .await
        .unwrap();

    assert_eq!(eliminated, 0);
    assert_eq!(app.records().await.len(), 3);
}

#[tokio::test]
async fn identical_unlinked_entries_are_consolidated() {
    let app = TestApp::spawn().await;
    let first = app.log(date(2024, 1, 4), 25, "standup").await;
    app.log(date(2024, 1, 4), 20, "standup").await;

    let eliminated = app
        .orchestrator
        .recombine_unlinked_fragments(common::TEST_COMPANY_ID)
        .await
        .unwrap();

    assert_eq!(eliminated, 1);
    let records = app.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, first.id);
    assert_eq!(records[0].minutes_worked, 45);
}

#[tokio::test]
async fn billable_and_non_billable_entries_are_not_merged() {
    let app = TestApp::spawn().await;
    let billable = app.log(date(2024, 1, 4), 30, "standup").await;
    app.store
        .insert_record(NewTimeRecord {
            company_id: TEST_COMPANY_ID,
            project_id: TEST_PROJECT_ID,
            task_id: None,
            user_id: TEST_USER_ID,
            description: "standup".to_string(),
            job_type: Some("development".to_string()),
            minutes_worked: 15,
            date_worked: date(2024, 1, 4),
            is_billable: false,
            linked_line_id: None,
        })
        .await;

    let eliminated = app
        .orchestrator
        .recombine_unlinked_fragments(TEST_COMPANY_ID)
        .await
        .unwrap();

    assert_eq!(eliminated, 0);
    let records = app.records().await;
    assert_eq!(records.len(), 2);
    let kept = records.iter().find(|record| record.id == billable.id).unwrap();
    assert_eq!(kept.minutes_worked, 30);
    assert!(kept.is_billable);
}
