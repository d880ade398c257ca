//! Invoice line model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Line type. System-generated types are rebuilt on every regeneration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineType {
    Retainer,
    PriorMonthRetainer,
    AdditionalHours,
    PriorMonthBillable,
    Expense,
    Adjustment,
    Credit,
}

impl LineType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineType::Retainer => "retainer",
            LineType::PriorMonthRetainer => "prior_month_retainer",
            LineType::AdditionalHours => "additional_hours",
            LineType::PriorMonthBillable => "prior_month_billable",
            LineType::Expense => "expense",
            LineType::Adjustment => "adjustment",
            LineType::Credit => "credit",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "retainer" => Some(LineType::Retainer),
            "prior_month_retainer" => Some(LineType::PriorMonthRetainer),
            "additional_hours" => Some(LineType::AdditionalHours),
            "prior_month_billable" => Some(LineType::PriorMonthBillable),
            "expense" => Some(LineType::Expense),
            "adjustment" => Some(LineType::Adjustment),
            "credit" => Some(LineType::Credit),
            _ => None,
        }
    }

    /// Owned by the orchestrator rather than the operator.
    pub fn is_system_generated(&self) -> bool {
        !matches!(self, LineType::Expense | LineType::Adjustment)
    }
}

/// Line item on an invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct InvoiceLine {
    pub id: i64,
    pub invoice_id: i64,
    pub description: String,
    /// Display quantity, either `1` or an `h:mm` duration.
    pub quantity: String,
    pub unit_price: Decimal,
    pub line_total: Decimal,
    pub line_type: String,
    pub hours: Option<Decimal>,
    pub sort_order: i32,
    pub created_utc: DateTime<Utc>,
}

impl InvoiceLine {
    pub fn kind(&self) -> Option<LineType> {
        LineType::from_string(&self.line_type)
    }

    /// Unknown line types are treated as operator-owned so they are never dropped.
    pub fn is_system_generated(&self) -> bool {
        self.kind().is_some_and(|kind| kind.is_system_generated())
    }
}

/// Input for creating a line item.
#[derive(Debug, Clone)]
pub struct NewInvoiceLine {
    pub invoice_id: i64,
    pub description: String,
    pub quantity: String,
    pub unit_price: Decimal,
    pub line_total: Decimal,
    pub line_type: LineType,
    pub hours: Option<Decimal>,
    pub sort_order: i32,
}

/// Operator-entered line; the orchestrator fills in invoice and ordering.
#[derive(Debug, Clone)]
pub struct ManualLine {
    pub description: String,
    pub quantity: String,
    pub unit_price: Decimal,
    pub line_total: Decimal,
    pub line_type: LineType,
}
