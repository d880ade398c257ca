//! Allocation fragments.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Capacity pool a fragment of work is assigned to, in drain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationType {
    PriorMonthRetainer,
    CurrentMonthRetainer,
    CatchUp,
    BillableCatchup,
}

impl AllocationType {
    pub const ORDER: [AllocationType; 4] = [
        AllocationType::PriorMonthRetainer,
        AllocationType::CurrentMonthRetainer,
        AllocationType::CatchUp,
        AllocationType::BillableCatchup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationType::PriorMonthRetainer => "prior_month_retainer",
            AllocationType::CurrentMonthRetainer => "current_month_retainer",
            AllocationType::CatchUp => "catch_up",
            AllocationType::BillableCatchup => "billable_catchup",
        }
    }

    /// Covered by retainer capacity rather than billed at the hourly rate.
    pub fn is_retainer(&self) -> bool {
        matches!(
            self,
            AllocationType::PriorMonthRetainer | AllocationType::CurrentMonthRetainer
        )
    }
}

/// Portion of one time record assigned to one pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeFragment {
    pub original_record_id: i64,
    pub minutes: i64,
    pub date_worked: NaiveDate,
    pub allocation_type: AllocationType,
}
