//! Domain errors for the billing engine.

use chrono::NaiveDate;
use service_core::error::AppError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("No active agreement for company {company_id} as of {as_of}")]
    NoActiveAgreement { company_id: i64, as_of: NaiveDate },

    #[error("Period overlaps invoice {invoice_number} (id {invoice_id})")]
    OverlappingPeriod {
        invoice_id: i64,
        invoice_number: String,
    },

    #[error(
        "Invalid split point {split_at} for record {record_id} with {minutes_worked} minutes"
    )]
    InvalidSplitPoint {
        record_id: i64,
        split_at: i64,
        minutes_worked: i64,
    },

    #[error("Invoice {invoice_id} is {status} and cannot be edited")]
    NotEditable { invoice_id: i64, status: String },

    #[error("Invalid target status: {0}")]
    InvalidTargetStatus(String),

    #[error("Cannot {action} invoice {invoice_id} while {from}")]
    InvalidTransition {
        invoice_id: i64,
        from: String,
        action: &'static str,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] AppError),
}

impl BillingError {
    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            BillingError::NoActiveAgreement { .. } => "no_active_agreement",
            BillingError::OverlappingPeriod { .. } => "overlapping_period",
            BillingError::InvalidSplitPoint { .. } => "invalid_split_point",
            BillingError::NotEditable { .. } => "not_editable",
            BillingError::InvalidTargetStatus(_) => "invalid_target_status",
            BillingError::InvalidTransition { .. } => "invalid_transition",
            BillingError::Configuration(_) => "configuration",
            BillingError::InvalidInput(_) => "invalid_input",
            BillingError::NotFound(_) => "not_found",
            BillingError::Store(e) => e.kind(),
        }
    }
}

pub type Result<T, E = BillingError> = std::result::Result<T, E>;
