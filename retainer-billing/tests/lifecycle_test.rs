//! Invoice status lifecycle and draft editing tests for retainer-billing.

mod common;

use common::{date, dec, standard_terms, TestApp, TEST_COMPANY_ID, TEST_PROJECT_ID, TEST_USER_ID};
use retainer_billing::models::{InvoiceStatus, LineType, ManualLine, NewTimeRecord, UpdateInvoice};
use retainer_billing::BillingError;
use rust_decimal::Decimal;

fn adjustment(amount: &str) -> ManualLine {
    ManualLine {
        description: "Goodwill adjustment".to_string(),
        quantity: "1".to_string(),
        unit_price: dec(amount),
        line_total: dec(amount),
        line_type: LineType::Adjustment,
    }
}

#[tokio::test]
async fn draft_is_issued_then_paid() {
    let app = TestApp::spawn().await;
    let document = app.generate_month(2024, 1).await;
    let id = document.invoice.id;

    let err = app.orchestrator.mark_paid(id).await.unwrap_err();
    assert!(matches!(err, BillingError::InvalidTransition { action: "mark paid", .. }));

    let issued = app.orchestrator.issue(id).await.unwrap();
    assert_eq!(issued.status(), InvoiceStatus::Issued);

    let err = app.orchestrator.issue(id).await.unwrap_err();
    assert!(matches!(err, BillingError::InvalidTransition { .. }));

    app.orchestrator
        .record_payment(id, dec("1000"), date(2024, 2, 10))
        .await
        .unwrap();
    let paid = app.orchestrator.mark_paid(id).await.unwrap();
    assert_eq!(paid.status(), InvoiceStatus::Paid);
}

#[tokio::test]
async fn editing_requires_draft() {
    let app = TestApp::spawn().await;
    let record = app.log(date(2024, 1, 4), 60, "call").await;
    let document = app.generate_month(2024, 1).await;
    let id = document.invoice.id;
    let line_id = document.lines[0].id;
    app.orchestrator.issue(id).await.unwrap();

    let not_editable = |err: BillingError| matches!(err, BillingError::NotEditable { status, .. } if status == "issued");

    assert!(not_editable(
        app.orchestrator
            .update(id, UpdateInvoice::default())
            .await
            .unwrap_err()
    ));
    assert!(not_editable(
        app.orchestrator
            .add_line_item(id, adjustment("10"))
            .await
            .unwrap_err()
    ));
    assert!(not_editable(
        app.orchestrator
            .remove_line_item(id, line_id)
            .await
            .unwrap_err()
    ));
    assert!(not_editable(
        app.orchestrator
            .unlink_entry(id, record.id)
            .await
            .unwrap_err()
    ));
    assert!(not_editable(
        app.orchestrator
            .link_entry(id, record.id, line_id)
            .await
            .unwrap_err()
    ));
}

#[tokio::test]
async fn draft_update_sets_notes_and_due_date() {
    let app = TestApp::spawn().await;
    let document = app.generate_month(2024, 1).await;

    let updated = app
        .orchestrator
        .update(
            document.invoice.id,
            UpdateInvoice {
                notes: Some("Net 15".to_string()),
                due_date: Some(date(2024, 2, 15)),
            },
        )
        .await
        .unwrap();

    assert_eq!(updated.notes.as_deref(), Some("Net 15"));
    assert_eq!(updated.due_date, Some(date(2024, 2, 15)));
}

#[tokio::test]
async fn manual_lines_adjust_the_total() {
    let app = TestApp::spawn().await;
    let document = app.generate_month(2024, 1).await;
    let id = document.invoice.id;

    let err = app
        .orchestrator
        .add_line_item(
            id,
            ManualLine {
                line_type: LineType::Retainer,
                ..adjustment("10")
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidInput(_)));

    let line = app.orchestrator.add_line_item(id, adjustment("-50")).await.unwrap();
    let with_line = app.orchestrator.get_invoice(id).await.unwrap();
    assert_eq!(with_line.invoice.invoice_total, dec("950"));
    assert_eq!(with_line.manual_lines().count(), 1);

    let removed = app.orchestrator.remove_line_item(id, line.id).await.unwrap();
    assert_eq!(removed.invoice_total, dec("1000"));
}

#[tokio::test]
async fn entries_can_be_unlinked_and_relinked_on_drafts() {
    let app = TestApp::spawn().await;
    let first = app.log(date(2024, 1, 4), 90, "call").await;
    app.log(date(2024, 1, 5), 30, "email").await;
    let document = app.generate_month(2024, 1).await;
    let id = document.invoice.id;
    let retainer = document.lines[0].id;
    assert_eq!(document.invoice.hours_worked, dec("2"));

    let unlinked = app.orchestrator.unlink_entry(id, first.id).await.unwrap();
    assert_eq!(unlinked.hours_worked, dec("0.5"));

    let err = app.orchestrator.unlink_entry(id, first.id).await.unwrap_err();
    assert!(matches!(err, BillingError::InvalidInput(_)));

    let relinked = app.orchestrator.link_entry(id, first.id, retainer).await.unwrap();
    assert_eq!(relinked.hours_worked, dec("2"));

    let err = app.orchestrator.link_entry(id, first.id, retainer).await.unwrap_err();
    assert!(matches!(err, BillingError::InvalidInput(_)));
}

#[tokio::test]
async fn link_entry_requires_billable_work_inside_the_period() {
    let app = TestApp::spawn().await;
    let february = app.generate_month(2024, 2).await;
    let id = february.invoice.id;
    let retainer = february.lines[0].id;

    let january = app.log(date(2024, 1, 31), 60, "late call").await;
    let err = app
        .orchestrator
        .link_entry(id, january.id, retainer)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidInput(_)));

    let internal = app
        .store
        .insert_record(NewTimeRecord {
            company_id: TEST_COMPANY_ID,
            project_id: TEST_PROJECT_ID,
            task_id: None,
            user_id: TEST_USER_ID,
            description: "internal sync".to_string(),
            job_type: None,
            minutes_worked: 45,
            date_worked: date(2024, 2, 6),
            is_billable: false,
            linked_line_id: None,
        })
        .await;
    let err = app
        .orchestrator
        .link_entry(id, internal.id, retainer)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidInput(_)));
    assert!(!app.records().await.iter().any(|record| record.is_linked()));

    let call = app.log(date(2024, 2, 6), 60, "call").await;
    let linked = app.orchestrator.link_entry(id, call.id, retainer).await.unwrap();
    assert_eq!(linked.hours_worked, dec("1"));
}

#[tokio::test]
async fn void_is_rejected_with_payments_or_when_paid() {
    let app = TestApp::spawn().await;
    let document = app.generate_month(2024, 1).await;
    let id = document.invoice.id;
    app.orchestrator.issue(id).await.unwrap();

    let err = app
        .orchestrator
        .record_payment(id, Decimal::ZERO, date(2024, 2, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidInput(_)));

    app.orchestrator
        .record_payment(id, dec("400"), date(2024, 2, 1))
        .await
        .unwrap();
    let err = app.orchestrator.void(id).await.unwrap_err();
    assert!(matches!(err, BillingError::InvalidTransition { action: "void", .. }));

    app.orchestrator.mark_paid(id).await.unwrap();
    let err = app.orchestrator.void(id).await.unwrap_err();
    assert!(matches!(err, BillingError::InvalidTransition { .. }));
}

#[tokio::test]
async fn payments_require_an_issued_invoice() {
    let app = TestApp::spawn().await;
    let document = app.generate_month(2024, 1).await;

    let err = app
        .orchestrator
        .record_payment(document.invoice.id, dec("100"), date(2024, 2, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidTransition { .. }));
}

#[tokio::test]
async fn void_releases_and_recombines_records() {
    let app = TestApp::spawn_billing_excess().await;
    let original = app.log(date(2024, 1, 10), 780, "data migration").await;
    let document = app.generate_month(2024, 1).await;
    assert_eq!(app.records().await.len(), 2);

    let voided = app.orchestrator.void(document.invoice.id).await.unwrap();
    assert_eq!(voided.status(), InvoiceStatus::Void);

    let records = app.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, original.id);
    assert_eq!(records[0].minutes_worked, 780);
    assert!(!records[0].is_linked());
}

#[tokio::test]
async fn unvoid_validates_target_and_relinks() {
    let app = TestApp::spawn_billing_excess().await;
    app.log(date(2024, 1, 10), 780, "data migration").await;
    let document = app.generate_month(2024, 1).await;
    let id = document.invoice.id;
    let retainer = document
        .lines
        .iter()
        .find(|line| line.kind() == Some(LineType::Retainer))
        .unwrap()
        .id;
    let additional = document
        .lines
        .iter()
        .find(|line| line.kind() == Some(LineType::AdditionalHours))
        .unwrap()
        .id;

    let err = app.orchestrator.unvoid(id, InvoiceStatus::Draft).await.unwrap_err();
    assert!(matches!(err, BillingError::InvalidTransition { action: "unvoid", .. }));

    app.orchestrator.void(id).await.unwrap();

    let err = app.orchestrator.unvoid(id, InvoiceStatus::Void).await.unwrap_err();
    assert!(matches!(err, BillingError::InvalidTargetStatus(_)));

    let restored = app.orchestrator.unvoid(id, InvoiceStatus::Issued).await.unwrap();
    assert_eq!(restored.status(), InvoiceStatus::Issued);
    assert_eq!(app.linked_minutes(retainer).await, 600);
    assert_eq!(app.linked_minutes(additional).await, 180);
    assert_eq!(app.total_minutes().await, 780);
}

#[tokio::test]
async fn unvoid_is_blocked_by_a_newer_invoice() {
    let app = TestApp::spawn().await;
    let first = app.generate_month(2024, 1).await;
    app.orchestrator.void(first.invoice.id).await.unwrap();
    let replacement = app.generate_month(2024, 1).await;

    let err = app
        .orchestrator
        .unvoid(first.invoice.id, InvoiceStatus::Draft)
        .await
        .unwrap_err();
    match err {
        BillingError::OverlappingPeriod { invoice_id, .. } => {
            assert_eq!(invoice_id, replacement.invoice.id)
        }
        other => panic!("expected OverlappingPeriod, got {:?}", other),
    }
}

#[tokio::test]
async fn unknown_invoice_is_not_found() {
    let app = TestApp::spawn().await;
    let err = app.orchestrator.issue(9_999).await.unwrap_err();
    assert!(matches!(err, BillingError::NotFound(_)));
}

#[tokio::test]
async fn unvoid_keeps_hours_equal_to_relinked_time() {
    let app = TestApp::spawn().await;
    app.log(date(2024, 1, 5), 300, "design").await;
    app.log(date(2024, 1, 20), 180, "review").await;
    let january = app.generate_month(2024, 1).await;
    assert_eq!(january.invoice.hours_worked, dec("8"));
    app.orchestrator.void(january.invoice.id).await.unwrap();

    // A separate agreement bills the early January work while the invoice is void.
    let side = app.orchestrator.create_agreement(standard_terms()).await.unwrap();
    let side_invoice = app
        .orchestrator
        .generate_invoice(&app.company, &side, date(2024, 1, 1), date(2024, 1, 10))
        .await
        .unwrap();
    assert_eq!(side_invoice.invoice.hours_worked, dec("5"));

    let restored = app
        .orchestrator
        .unvoid(january.invoice.id, InvoiceStatus::Draft)
        .await
        .unwrap();
    assert_eq!(restored.status(), InvoiceStatus::Draft);
    assert_eq!(restored.hours_worked, dec("3"));

    let document = app.orchestrator.get_invoice(january.invoice.id).await.unwrap();
    let mut linked = 0;
    for line in &document.lines {
        linked += app.linked_minutes(line.id).await;
    }
    assert_eq!(linked, 180);
}
