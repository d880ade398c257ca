//! In-memory store for tests and embedding.
//!
//! A session owns the store lock for its whole lifetime and mutates a working
//! copy of the state; `commit` publishes the copy, dropping the session
//! discards it.

use crate::models::{
    Agreement, Company, DateRange, Invoice, InvoiceBalances, InvoiceLine, InvoiceStatus,
    MergeKey, NewAgreement, NewInvoice, NewInvoiceLine, NewTimeRecord, Payment, TimeRecord,
    UpdateInvoice, UpdateTimeRecord,
};
use crate::services::repository::{
    AgreementProvider, BillingSession, BillingStore, InvoiceRepository, TimeRecordRepository,
};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, Default)]
struct State {
    companies: BTreeMap<i64, Company>,
    agreements: BTreeMap<i64, Agreement>,
    records: BTreeMap<i64, TimeRecord>,
    invoices: BTreeMap<i64, Invoice>,
    lines: BTreeMap<i64, InvoiceLine>,
    payments: BTreeMap<i64, Payment>,
    last_id: i64,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn invoice_mut(&mut self, invoice_id: i64) -> Result<&mut Invoice, AppError> {
        self.invoices
            .get_mut(&invoice_id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice {} not found", invoice_id)))
    }

    fn insert_record(&mut self, input: &NewTimeRecord) -> TimeRecord {
        let record = TimeRecord {
            id: self.next_id(),
            company_id: input.company_id,
            project_id: input.project_id,
            task_id: input.task_id,
            user_id: input.user_id,
            description: input.description.clone(),
            job_type: input.job_type.clone(),
            minutes_worked: input.minutes_worked,
            date_worked: input.date_worked,
            is_billable: input.is_billable,
            linked_line_id: input.linked_line_id,
            created_utc: Utc::now(),
        };
        self.records.insert(record.id, record.clone());
        record
    }
}

/// Shared in-memory store. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a company (for testing).
    pub async fn insert_company(&self, company: Company) -> Company {
        let mut state = self.state.lock().await;
        state.last_id = state.last_id.max(company.id);
        state.companies.insert(company.id, company.clone());
        company
    }

    /// Seed a time record (for testing).
    pub async fn insert_record(&self, input: NewTimeRecord) -> TimeRecord {
        self.state.lock().await.insert_record(&input)
    }

    /// Every time record of a company, ordered by id.
    pub async fn records(&self, company_id: i64) -> Vec<TimeRecord> {
        let state = self.state.lock().await;
        state
            .records
            .values()
            .filter(|record| record.company_id == company_id)
            .cloned()
            .collect()
    }

    /// Every invoice of a company, ordered by id.
    pub async fn invoices(&self, company_id: i64) -> Vec<Invoice> {
        let state = self.state.lock().await;
        state
            .invoices
            .values()
            .filter(|invoice| invoice.company_id == company_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl BillingStore for InMemoryStore {
    type Session = InMemorySession;

    async fn begin(&self) -> Result<Self::Session, AppError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let working = guard.clone();
        Ok(InMemorySession { guard, working })
    }
}

pub struct InMemorySession {
    guard: OwnedMutexGuard<State>,
    working: State,
}

#[async_trait]
impl BillingSession for InMemorySession {
    async fn lock_company(&mut self, _company_id: i64) -> Result<(), AppError> {
        // The session already holds the store-wide lock.
        Ok(())
    }

    async fn commit(self) -> Result<(), AppError> {
        let InMemorySession { mut guard, working } = self;
        *guard = working;
        Ok(())
    }
}

#[async_trait]
impl AgreementProvider for InMemorySession {
    async fn active_agreement_for(
        &mut self,
        company_id: i64,
        as_of: NaiveDate,
    ) -> Result<Option<Agreement>, AppError> {
        Ok(self
            .working
            .agreements
            .values()
            .filter(|agreement| agreement.company_id == company_id && agreement.is_active_on(as_of))
            .max_by_key(|agreement| (agreement.active_date, agreement.id))
            .cloned())
    }

    async fn get_company(&mut self, company_id: i64) -> Result<Option<Company>, AppError> {
        Ok(self.working.companies.get(&company_id).cloned())
    }

    async fn create_agreement(&mut self, input: &NewAgreement) -> Result<Agreement, AppError> {
        let agreement = Agreement {
            id: self.working.next_id(),
            company_id: input.company_id,
            monthly_retainer_hours: input.monthly_retainer_hours,
            catch_up_threshold_hours: input.catch_up_threshold_hours,
            hourly_rate: input.hourly_rate,
            monthly_retainer_fee: input.monthly_retainer_fee,
            rollover_months: input.rollover_months,
            active_date: input.active_date,
            termination_date: input.termination_date,
        };
        self.working.agreements.insert(agreement.id, agreement.clone());
        Ok(agreement)
    }
}

#[async_trait]
impl TimeRecordRepository for InMemorySession {
    async fn find_unlinked_billable(
        &mut self,
        company_id: i64,
        range: DateRange,
    ) -> Result<Vec<TimeRecord>, AppError> {
        let mut records: Vec<TimeRecord> = self
            .working
            .records
            .values()
            .filter(|record| {
                record.company_id == company_id
                    && record.is_billable
                    && !record.is_linked()
                    && range.contains(record.date_worked)
            })
            .cloned()
            .collect();
        records.sort_by_key(|record| (record.date_worked, record.id));
        Ok(records)
    }

    async fn find_unlinked(&mut self, company_id: i64) -> Result<Vec<TimeRecord>, AppError> {
        Ok(self
            .working
            .records
            .values()
            .filter(|record| record.company_id == company_id && !record.is_linked())
            .cloned()
            .collect())
    }

    async fn find_by_merge_key(
        &mut self,
        company_id: i64,
        key: &MergeKey,
    ) -> Result<Vec<TimeRecord>, AppError> {
        Ok(self
            .working
            .records
            .values()
            .filter(|record| record.company_id == company_id && record.merge_key() == *key)
            .cloned()
            .collect())
    }

    async fn find_by_lines(&mut self, line_ids: &[i64]) -> Result<Vec<TimeRecord>, AppError> {
        Ok(self
            .working
            .records
            .values()
            .filter(|record| record.linked_line_id.is_some_and(|id| line_ids.contains(&id)))
            .cloned()
            .collect())
    }

    async fn get_record(&mut self, record_id: i64) -> Result<Option<TimeRecord>, AppError> {
        Ok(self.working.records.get(&record_id).cloned())
    }

    async fn link_to_line(&mut self, record_id: i64, line_id: i64) -> Result<(), AppError> {
        if !self.working.lines.contains_key(&line_id) {
            return Err(AppError::NotFound(anyhow::anyhow!("Line {} not found", line_id)));
        }
        let record = self.working.records.get_mut(&record_id).ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Time record {} not found", record_id))
        })?;
        record.linked_line_id = Some(line_id);
        Ok(())
    }

    async fn unlink_lines(&mut self, line_ids: &[i64]) -> Result<u64, AppError> {
        let mut released = 0u64;
        for record in self.working.records.values_mut() {
            if record.linked_line_id.is_some_and(|id| line_ids.contains(&id)) {
                record.linked_line_id = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn unlink_record(&mut self, record_id: i64) -> Result<(), AppError> {
        if let Some(record) = self.working.records.get_mut(&record_id) {
            record.linked_line_id = None;
        }
        Ok(())
    }

    async fn create_record(&mut self, input: &NewTimeRecord) -> Result<TimeRecord, AppError> {
        Ok(self.working.insert_record(input))
    }

    async fn update_record(
        &mut self,
        record_id: i64,
        input: &UpdateTimeRecord,
    ) -> Result<Option<TimeRecord>, AppError> {
        let Some(record) = self.working.records.get_mut(&record_id) else {
            return Ok(None);
        };
        if let Some(minutes) = input.minutes_worked {
            record.minutes_worked = minutes;
        }
        if let Some(description) = &input.description {
            record.description = description.clone();
        }
        if let Some(is_billable) = input.is_billable {
            record.is_billable = is_billable;
        }
        Ok(Some(record.clone()))
    }

    async fn delete_record(&mut self, record_id: i64) -> Result<bool, AppError> {
        Ok(self.working.records.remove(&record_id).is_some())
    }
}

#[async_trait]
impl InvoiceRepository for InMemorySession {
    async fn find_overlapping(
        &mut self,
        company_id: i64,
        agreement_id: i64,
        range: DateRange,
    ) -> Result<Vec<Invoice>, AppError> {
        Ok(self
            .working
            .invoices
            .values()
            .filter(|invoice| {
                invoice.company_id == company_id
                    && invoice.agreement_id == agreement_id
                    && !invoice.is_void()
                    && invoice.range().overlaps(&range)
            })
            .cloned()
            .collect())
    }

    async fn find_prior_non_void(
        &mut self,
        company_id: i64,
        agreement_id: i64,
        before: NaiveDate,
    ) -> Result<Option<Invoice>, AppError> {
        Ok(self
            .working
            .invoices
            .values()
            .filter(|invoice| {
                invoice.company_id == company_id
                    && invoice.agreement_id == agreement_id
                    && !invoice.is_void()
                    && invoice.period_end < before
            })
            .max_by_key(|invoice| (invoice.period_end, invoice.id))
            .cloned())
    }

    async fn find_non_void_in_window(
        &mut self,
        agreement_id: i64,
        window: DateRange,
    ) -> Result<Vec<Invoice>, AppError> {
        let mut invoices: Vec<Invoice> = self
            .working
            .invoices
            .values()
            .filter(|invoice| {
                invoice.agreement_id == agreement_id
                    && !invoice.is_void()
                    && window.contains(invoice.period_start)
            })
            .cloned()
            .collect();
        invoices.sort_by_key(|invoice| (invoice.period_start, invoice.id));
        Ok(invoices)
    }

    async fn get_invoice(&mut self, invoice_id: i64) -> Result<Option<Invoice>, AppError> {
        Ok(self.working.invoices.get(&invoice_id).cloned())
    }

    async fn invoice_numbers_with_prefix(
        &mut self,
        company_id: i64,
        prefix: &str,
    ) -> Result<Vec<String>, AppError> {
        Ok(self
            .working
            .invoices
            .values()
            .filter(|invoice| {
                invoice.company_id == company_id && invoice.invoice_number.starts_with(prefix)
            })
            .map(|invoice| invoice.invoice_number.clone())
            .collect())
    }

    async fn create_invoice(&mut self, input: &NewInvoice) -> Result<Invoice, AppError> {
        let period = input.period;
        let clash = self.working.invoices.values().any(|invoice| {
            !invoice.is_void()
                && invoice.covers_exactly(&period)
                && invoice.company_id == period.company_id
        });
        if clash {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Invoice for agreement {} {}..{} already exists",
                period.agreement_id,
                period.period_start,
                period.period_end
            )));
        }

        let now = Utc::now();
        let balances = &input.balances;
        let invoice = Invoice {
            id: self.working.next_id(),
            company_id: period.company_id,
            agreement_id: period.agreement_id,
            invoice_number: input.invoice_number.clone(),
            period_start: period.period_start,
            period_end: period.period_end,
            status: InvoiceStatus::Draft.as_str().to_string(),
            retainer_hours_included: balances.retainer_hours_included,
            hours_worked: balances.hours_worked,
            rollover_hours_used: balances.rollover_hours_used,
            unused_hours_balance: balances.unused_hours_balance,
            negative_hours_balance: balances.negative_hours_balance,
            hours_billed_at_rate: balances.hours_billed_at_rate,
            buffer_hours_billed: balances.buffer_hours_billed,
            invoice_total: Decimal::ZERO,
            starting_unused_hours: balances.starting_unused_hours,
            starting_negative_hours: balances.starting_negative_hours,
            notes: None,
            due_date: None,
            created_utc: now,
            updated_utc: now,
        };
        self.working.invoices.insert(invoice.id, invoice.clone());
        Ok(invoice)
    }

    async fn update_balances(
        &mut self,
        invoice_id: i64,
        balances: &InvoiceBalances,
    ) -> Result<Invoice, AppError> {
        let invoice = self.working.invoice_mut(invoice_id)?;
        invoice.retainer_hours_included = balances.retainer_hours_included;
        invoice.hours_worked = balances.hours_worked;
        invoice.rollover_hours_used = balances.rollover_hours_used;
        invoice.unused_hours_balance = balances.unused_hours_balance;
        invoice.negative_hours_balance = balances.negative_hours_balance;
        invoice.hours_billed_at_rate = balances.hours_billed_at_rate;
        invoice.buffer_hours_billed = balances.buffer_hours_billed;
        invoice.starting_unused_hours = balances.starting_unused_hours;
        invoice.starting_negative_hours = balances.starting_negative_hours;
        invoice.updated_utc = Utc::now();
        Ok(invoice.clone())
    }

    async fn update_invoice(
        &mut self,
        invoice_id: i64,
        input: &UpdateInvoice,
    ) -> Result<Invoice, AppError> {
        let invoice = self.working.invoice_mut(invoice_id)?;
        if let Some(notes) = &input.notes {
            invoice.notes = Some(notes.clone());
        }
        if let Some(due_date) = input.due_date {
            invoice.due_date = Some(due_date);
        }
        invoice.updated_utc = Utc::now();
        Ok(invoice.clone())
    }

    async fn set_status(
        &mut self,
        invoice_id: i64,
        status: InvoiceStatus,
    ) -> Result<Invoice, AppError> {
        let invoice = self.working.invoice_mut(invoice_id)?;
        invoice.status = status.as_str().to_string();
        invoice.updated_utc = Utc::now();
        Ok(invoice.clone())
    }

    async fn set_total(&mut self, invoice_id: i64, total: Decimal) -> Result<Invoice, AppError> {
        let invoice = self.working.invoice_mut(invoice_id)?;
        invoice.invoice_total = total;
        invoice.updated_utc = Utc::now();
        Ok(invoice.clone())
    }

    async fn list_lines(&mut self, invoice_id: i64) -> Result<Vec<InvoiceLine>, AppError> {
        let mut lines: Vec<InvoiceLine> = self
            .working
            .lines
            .values()
            .filter(|line| line.invoice_id == invoice_id)
            .cloned()
            .collect();
        lines.sort_by_key(|line| (line.sort_order, line.id));
        Ok(lines)
    }

    async fn get_line(&mut self, line_id: i64) -> Result<Option<InvoiceLine>, AppError> {
        Ok(self.working.lines.get(&line_id).cloned())
    }

    async fn create_line(&mut self, input: &NewInvoiceLine) -> Result<InvoiceLine, AppError> {
        self.working.invoice_mut(input.invoice_id)?;
        let line = InvoiceLine {
            id: self.working.next_id(),
            invoice_id: input.invoice_id,
            description: input.description.clone(),
            quantity: input.quantity.clone(),
            unit_price: input.unit_price,
            line_total: input.line_total,
            line_type: input.line_type.as_str().to_string(),
            hours: input.hours,
            sort_order: input.sort_order,
            created_utc: Utc::now(),
        };
        self.working.lines.insert(line.id, line.clone());
        Ok(line)
    }

    async fn delete_line(&mut self, line_id: i64) -> Result<bool, AppError> {
        Ok(self.working.lines.remove(&line_id).is_some())
    }

    async fn create_payment(
        &mut self,
        invoice_id: i64,
        amount: Decimal,
        payment_date: NaiveDate,
    ) -> Result<Payment, AppError> {
        self.working.invoice_mut(invoice_id)?;
        let payment = Payment {
            id: self.working.next_id(),
            invoice_id,
            amount,
            payment_date,
            created_utc: Utc::now(),
        };
        self.working.payments.insert(payment.id, payment.clone());
        Ok(payment)
    }

    async fn count_payments(&mut self, invoice_id: i64) -> Result<i64, AppError> {
        Ok(self
            .working
            .payments
            .values()
            .filter(|payment| payment.invoice_id == invoice_id)
            .count() as i64)
    }
}
