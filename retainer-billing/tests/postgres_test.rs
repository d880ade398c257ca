//! PostgreSQL store smoke test for retainer-billing.
//!
//! Runs only when `TEST_DATABASE_URL` is set; each run uses its own schema.

use chrono::NaiveDate;
use retainer_billing::models::{LineType, NewAgreement, NewTimeRecord};
use retainer_billing::services::{
    init_metrics, BillingPolicy, BillingSession, BillingStore, InvoiceOrchestrator, PgStore,
    TimeRecordRepository,
};
use rust_decimal::Decimal;

fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap()
}

async fn isolated_store(base_url: &str) -> (PgStore, String) {
    let schema_name = format!("test_retainer_{}", std::process::id());

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(1)
        .connect(base_url)
        .await
        .expect("Failed to connect to test database");
    sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema_name))
        .execute(&pool)
        .await
        .ok();
    sqlx::query(&format!("CREATE SCHEMA {}", schema_name))
        .execute(&pool)
        .await
        .expect("Failed to create test schema");
    pool.close().await;

    let separator = if base_url.contains('?') { "&" } else { "?" };
    let url = format!("{}{}options=-c search_path%3D{}", base_url, separator, schema_name);

    let store = PgStore::new(&url, 2, 1).await.expect("Failed to create store");
    store.run_migrations().await.expect("Failed to run migrations");
    (store, schema_name)
}

#[tokio::test]
async fn generates_and_voids_against_postgres() {
    let Ok(base_url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return;
    };
    init_metrics();

    let (store, schema_name) = isolated_store(&base_url).await;
    let company = store.create_company("Acme Corp", "acme").await.unwrap();
    let orchestrator = InvoiceOrchestrator::new(
        store.clone(),
        BillingPolicy {
            bill_excess_immediately: true,
        },
    );

    orchestrator
        .create_agreement(NewAgreement {
            company_id: company.id,
            monthly_retainer_hours: Decimal::from(10),
            catch_up_threshold_hours: Decimal::ZERO,
            hourly_rate: Decimal::from(150),
            monthly_retainer_fee: Decimal::from(1000),
            rollover_months: 3,
            active_date: date(2024, 1, 1),
            termination_date: None,
        })
        .await
        .unwrap();

    let mut session = store.begin().await.unwrap();
    session
        .create_record(&NewTimeRecord {
            company_id: company.id,
            project_id: 1,
            task_id: None,
            user_id: 1,
            description: "data migration".to_string(),
            job_type: None,
            minutes_worked: 780,
            date_worked: date(2024, 1, 10),
            is_billable: true,
            linked_line_id: None,
        })
        .await
        .unwrap();
    session.commit().await.unwrap();

    let document = orchestrator
        .generate_for_period(company.id, date(2024, 1, 1), date(2024, 1, 31))
        .await
        .unwrap();
    assert_eq!(document.invoice.invoice_number, "ACME-202401-001");
    assert_eq!(document.invoice.invoice_total, Decimal::from(1450));
    assert!(document
        .lines
        .iter()
        .any(|line| line.kind() == Some(LineType::AdditionalHours)));

    let again = orchestrator
        .generate_for_period(company.id, date(2024, 1, 1), date(2024, 1, 31))
        .await
        .unwrap();
    assert!(again.regenerated);
    assert_eq!(again.invoice.id, document.invoice.id);

    orchestrator.void(document.invoice.id).await.unwrap();
    let mut session = store.begin().await.unwrap();
    let unlinked = session.find_unlinked(company.id).await.unwrap();
    assert_eq!(unlinked.len(), 1);
    assert_eq!(unlinked[0].minutes_worked, 780);
    drop(session);

    sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema_name))
        .execute(store.pool())
        .await
        .ok();
}
