//! Invoice period model.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

/// Inclusive calendar-date range an invoice covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Start-in-range, end-in-range or fully containing.
    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.contains(other.start) || self.contains(other.end) || other.contains(self.start)
    }
}

/// The period an invoice is generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoicePeriod {
    pub company_id: i64,
    pub agreement_id: i64,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
}

impl InvoicePeriod {
    pub fn range(&self) -> DateRange {
        DateRange::new(self.period_start, self.period_end)
    }

    /// `YYYYMM` of the period start, used in invoice numbers.
    pub fn month_code(&self) -> String {
        format!("{:04}{:02}", self.period_start.year(), self.period_start.month())
    }
}

/// Absolute month index (`year * 12 + month0`) for month arithmetic.
pub fn month_index(date: NaiveDate) -> i32 {
    date.year() * 12 + date.month0() as i32
}
