//! Invoice model for retainer billing.

use super::period::{DateRange, InvoicePeriod};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Invoice status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Issued,
    Paid,
    Void,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Issued => "issued",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Void => "void",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "issued" => InvoiceStatus::Issued,
            "paid" => InvoiceStatus::Paid,
            "void" => InvoiceStatus::Void,
            _ => InvoiceStatus::Draft,
        }
    }

    /// Strict parse for operator-supplied targets.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(InvoiceStatus::Draft),
            "issued" => Some(InvoiceStatus::Issued),
            "paid" => Some(InvoiceStatus::Paid),
            "void" => Some(InvoiceStatus::Void),
            _ => None,
        }
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Invoice for one retainer period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub id: i64,
    pub company_id: i64,
    pub agreement_id: i64,
    pub invoice_number: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub status: String,
    pub retainer_hours_included: Decimal,
    pub hours_worked: Decimal,
    pub rollover_hours_used: Decimal,
    pub unused_hours_balance: Decimal,
    pub negative_hours_balance: Decimal,
    pub hours_billed_at_rate: Decimal,
    /// Portion of `hours_billed_at_rate` billed to restore the catch-up buffer.
    pub buffer_hours_billed: Decimal,
    pub invoice_total: Decimal,
    pub starting_unused_hours: Option<Decimal>,
    pub starting_negative_hours: Option<Decimal>,
    pub notes: Option<String>,
    pub due_date: Option<NaiveDate>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Invoice {
    pub fn status(&self) -> InvoiceStatus {
        InvoiceStatus::from_string(&self.status)
    }

    pub fn is_void(&self) -> bool {
        self.status() == InvoiceStatus::Void
    }

    pub fn range(&self) -> DateRange {
        DateRange::new(self.period_start, self.period_end)
    }

    pub fn covers_exactly(&self, period: &InvoicePeriod) -> bool {
        self.agreement_id == period.agreement_id
            && self.period_start == period.period_start
            && self.period_end == period.period_end
    }

    /// Hours linked at the hourly rate, excluding buffer restoration.
    pub fn excess_hours_billed(&self) -> Decimal {
        (self.hours_billed_at_rate - self.buffer_hours_billed).max(Decimal::ZERO)
    }
}

/// Balance figures computed for a period.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvoiceBalances {
    pub retainer_hours_included: Decimal,
    pub hours_worked: Decimal,
    pub rollover_hours_used: Decimal,
    pub unused_hours_balance: Decimal,
    pub negative_hours_balance: Decimal,
    pub hours_billed_at_rate: Decimal,
    pub buffer_hours_billed: Decimal,
    pub starting_unused_hours: Option<Decimal>,
    pub starting_negative_hours: Option<Decimal>,
}

/// Input for creating a draft invoice.
#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub period: InvoicePeriod,
    pub invoice_number: String,
    pub balances: InvoiceBalances,
}

/// Input for updating an invoice (draft only).
#[derive(Debug, Clone, Default)]
pub struct UpdateInvoice {
    pub notes: Option<String>,
    pub due_date: Option<NaiveDate>,
}

/// Payment recorded against an issued invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub id: i64,
    pub invoice_id: i64,
    pub amount: Decimal,
    pub payment_date: NaiveDate,
    pub created_utc: DateTime<Utc>,
}
