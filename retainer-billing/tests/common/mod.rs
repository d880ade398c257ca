//! Test helper module for retainer-billing integration tests.
//!
//! Seeds an in-memory store with one company and one agreement.

#![allow(dead_code)]

use chrono::NaiveDate;
use retainer_billing::models::{Agreement, Company, NewAgreement, NewTimeRecord, TimeRecord};
use retainer_billing::services::{
    init_metrics, BillingPolicy, InMemoryStore, InvoiceDocument, InvoiceOrchestrator,
};
use retainer_billing::Result;
use rust_decimal::Decimal;
use std::str::FromStr;

pub const TEST_COMPANY_ID: i64 = 1;
pub const TEST_USER_ID: i64 = 7;
pub const TEST_PROJECT_ID: i64 = 3;

pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("valid date")
}

pub fn dec(value: &str) -> Decimal {
    Decimal::from_str(value).expect("valid decimal")
}

pub fn month_start(year: i32, month: u32) -> NaiveDate {
    date(year, month, 1)
}

pub fn month_end(year: i32, month: u32) -> NaiveDate {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    date(next_year, next_month, 1).pred_opt().expect("valid date")
}

/// Agreement terms used by the scenarios: 10h for 1000, 150/h, 3 months rollover.
pub fn standard_terms() -> NewAgreement {
    NewAgreement {
        company_id: TEST_COMPANY_ID,
        monthly_retainer_hours: dec("10"),
        catch_up_threshold_hours: Decimal::ZERO,
        hourly_rate: dec("150"),
        monthly_retainer_fee: dec("1000"),
        rollover_months: 3,
        active_date: date(2024, 1, 1),
        termination_date: None,
    }
}

/// In-memory application wrapper for integration tests.
pub struct TestApp {
    pub store: InMemoryStore,
    pub orchestrator: InvoiceOrchestrator<InMemoryStore>,
    pub company: Company,
    pub agreement: Agreement,
}

impl TestApp {
    /// Default policy with the standard agreement.
    pub async fn spawn() -> Self {
        Self::spawn_with(BillingPolicy::default(), standard_terms()).await
    }

    /// Overage billed on an additional-hours line.
    pub async fn spawn_billing_excess() -> Self {
        Self::spawn_with(
            BillingPolicy {
                bill_excess_immediately: true,
            },
            standard_terms(),
        )
        .await
    }

    pub async fn spawn_with(policy: BillingPolicy, terms: NewAgreement) -> Self {
        init_metrics();

        let store = InMemoryStore::new();
        let company = store
            .insert_company(Company {
                id: TEST_COMPANY_ID,
                name: "Acme Corp".to_string(),
                invoice_prefix: "acme".to_string(),
            })
            .await;

        let orchestrator = InvoiceOrchestrator::new(store.clone(), policy);
        let agreement = orchestrator
            .create_agreement(terms)
            .await
            .expect("Failed to create agreement");

        Self {
            store,
            orchestrator,
            company,
            agreement,
        }
    }

    /// Log billable minutes with a description unique to the call site.
    pub async fn log(&self, day: NaiveDate, minutes: i64, description: &str) -> TimeRecord {
        self.store
            .insert_record(NewTimeRecord {
                company_id: TEST_COMPANY_ID,
                project_id: TEST_PROJECT_ID,
                task_id: None,
                user_id: TEST_USER_ID,
                description: description.to_string(),
                job_type: Some("development".to_string()),
                minutes_worked: minutes,
                date_worked: day,
                is_billable: true,
                linked_line_id: None,
            })
            .await
    }

    pub async fn generate(&self, start: NaiveDate, end: NaiveDate) -> Result<InvoiceDocument> {
        self.orchestrator
            .generate_invoice(&self.company, &self.agreement, start, end)
            .await
    }

    pub async fn generate_month(&self, year: i32, month: u32) -> InvoiceDocument {
        self.generate(month_start(year, month), month_end(year, month))
            .await
            .expect("Failed to generate invoice")
    }

    pub async fn records(&self) -> Vec<TimeRecord> {
        self.store.records(TEST_COMPANY_ID).await
    }

    /// Minutes linked to `line_id`.
    pub async fn linked_minutes(&self, line_id: i64) -> i64 {
        self.records()
            .await
            .iter()
            .filter(|record| record.linked_line_id == Some(line_id))
            .map(|record| record.minutes_worked)
            .sum()
    }

    pub async fn total_minutes(&self) -> i64 {
        self.records().await.iter().map(|record| record.minutes_worked).sum()
    }
}
