//! Storage seams consumed by the engine.
//!
//! Every mutation sequence runs inside one [`BillingSession`]. A session that
//! is dropped without [`BillingSession::commit`] leaves no trace.

use crate::models::{
    Agreement, Company, DateRange, Invoice, InvoiceBalances, InvoiceLine, InvoiceStatus,
    MergeKey, NewAgreement, NewInvoice, NewInvoiceLine, NewTimeRecord, Payment, TimeRecord,
    UpdateInvoice, UpdateTimeRecord,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use service_core::error::AppError;

#[async_trait]
pub trait AgreementProvider: Send {
    /// Agreement in effect for `company_id` on `as_of`, if any.
    async fn active_agreement_for(
        &mut self,
        company_id: i64,
        as_of: NaiveDate,
    ) -> Result<Option<Agreement>, AppError>;

    async fn get_company(&mut self, company_id: i64) -> Result<Option<Company>, AppError>;

    async fn create_agreement(&mut self, input: &NewAgreement) -> Result<Agreement, AppError>;
}

#[async_trait]
pub trait TimeRecordRepository: Send {
    /// Billable, unlinked records dated within `range`, ordered by date then id.
    async fn find_unlinked_billable(
        &mut self,
        company_id: i64,
        range: DateRange,
    ) -> Result<Vec<TimeRecord>, AppError>;

    /// All unlinked records of a company regardless of billability.
    async fn find_unlinked(&mut self, company_id: i64) -> Result<Vec<TimeRecord>, AppError>;

    /// Every record sharing `key`, linked or not.
    async fn find_by_merge_key(
        &mut self,
        company_id: i64,
        key: &MergeKey,
    ) -> Result<Vec<TimeRecord>, AppError>;

    async fn find_by_lines(&mut self, line_ids: &[i64]) -> Result<Vec<TimeRecord>, AppError>;

    async fn get_record(&mut self, record_id: i64) -> Result<Option<TimeRecord>, AppError>;

    async fn link_to_line(&mut self, record_id: i64, line_id: i64) -> Result<(), AppError>;

    /// Clear the link on every record pointing at one of `line_ids`.
    async fn unlink_lines(&mut self, line_ids: &[i64]) -> Result<u64, AppError>;

    async fn unlink_record(&mut self, record_id: i64) -> Result<(), AppError>;

    async fn create_record(&mut self, input: &NewTimeRecord) -> Result<TimeRecord, AppError>;

    async fn update_record(
        &mut self,
        record_id: i64,
        input: &UpdateTimeRecord,
    ) -> Result<Option<TimeRecord>, AppError>;

    async fn delete_record(&mut self, record_id: i64) -> Result<bool, AppError>;
}

#[async_trait]
pub trait InvoiceRepository: Send {
    /// Non-void invoices of the agreement whose period intersects `range`.
    async fn find_overlapping(
        &mut self,
        company_id: i64,
        agreement_id: i64,
        range: DateRange,
    ) -> Result<Vec<Invoice>, AppError>;

    /// Latest non-void invoice ending before `before`.
    async fn find_prior_non_void(
        &mut self,
        company_id: i64,
        agreement_id: i64,
        before: NaiveDate,
    ) -> Result<Option<Invoice>, AppError>;

    /// Non-void invoices whose period starts within `window`, oldest first.
    async fn find_non_void_in_window(
        &mut self,
        agreement_id: i64,
        window: DateRange,
    ) -> Result<Vec<Invoice>, AppError>;

    /// Gross unused hours of non-void invoices starting within `window`.
    async fn sum_unused_in_window(
        &mut self,
        agreement_id: i64,
        window: DateRange,
    ) -> Result<Decimal, AppError> {
        let invoices = self.find_non_void_in_window(agreement_id, window).await?;
        Ok(invoices.iter().map(|invoice| invoice.unused_hours_balance).sum())
    }

    async fn get_invoice(&mut self, invoice_id: i64) -> Result<Option<Invoice>, AppError>;

    /// Invoice numbers of a company starting with `prefix`.
    async fn invoice_numbers_with_prefix(
        &mut self,
        company_id: i64,
        prefix: &str,
    ) -> Result<Vec<String>, AppError>;

    async fn create_invoice(&mut self, input: &NewInvoice) -> Result<Invoice, AppError>;

    async fn update_balances(
        &mut self,
        invoice_id: i64,
        balances: &InvoiceBalances,
    ) -> Result<Invoice, AppError>;

    async fn update_invoice(
        &mut self,
        invoice_id: i64,
        input: &UpdateInvoice,
    ) -> Result<Invoice, AppError>;

    async fn set_status(
        &mut self,
        invoice_id: i64,
        status: InvoiceStatus,
    ) -> Result<Invoice, AppError>;

    async fn set_total(&mut self, invoice_id: i64, total: Decimal) -> Result<Invoice, AppError>;

    /// Lines ordered by sort order, then id.
    async fn list_lines(&mut self, invoice_id: i64) -> Result<Vec<InvoiceLine>, AppError>;

    async fn get_line(&mut self, line_id: i64) -> Result<Option<InvoiceLine>, AppError>;

    async fn create_line(&mut self, input: &NewInvoiceLine) -> Result<InvoiceLine, AppError>;

    async fn delete_line(&mut self, line_id: i64) -> Result<bool, AppError>;

    async fn create_payment(
        &mut self,
        invoice_id: i64,
        amount: Decimal,
        payment_date: NaiveDate,
    ) -> Result<Payment, AppError>;

    async fn count_payments(&mut self, invoice_id: i64) -> Result<i64, AppError>;
}

/// A unit of work against the store.
#[async_trait]
pub trait BillingSession: AgreementProvider + TimeRecordRepository + InvoiceRepository {
    /// Serialize writers for one company until the session ends.
    async fn lock_company(&mut self, company_id: i64) -> Result<(), AppError>;

    async fn commit(self) -> Result<(), AppError>;
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    type Session: BillingSession;

    async fn begin(&self) -> Result<Self::Session, AppError>;
}
