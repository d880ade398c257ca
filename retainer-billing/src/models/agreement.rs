//! Retainer agreement model.

use crate::error::BillingError;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Contract terms in effect for a company.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Agreement {
    pub id: i64,
    pub company_id: i64,
    pub monthly_retainer_hours: Decimal,
    pub catch_up_threshold_hours: Decimal,
    pub hourly_rate: Decimal,
    pub monthly_retainer_fee: Decimal,
    /// Number of months unused hours stay usable. Zero disables rollover.
    pub rollover_months: i32,
    pub active_date: NaiveDate,
    pub termination_date: Option<NaiveDate>,
}

impl Agreement {
    /// Whether the agreement covers `date`.
    pub fn is_active_on(&self, date: NaiveDate) -> bool {
        self.active_date <= date && self.termination_date.map_or(true, |end| date <= end)
    }

    /// Rollover window as an unsigned month count.
    pub fn rollover_window(&self) -> u32 {
        self.rollover_months.max(0) as u32
    }
}

/// Input for creating an agreement.
#[derive(Debug, Clone)]
pub struct NewAgreement {
    pub company_id: i64,
    pub monthly_retainer_hours: Decimal,
    pub catch_up_threshold_hours: Decimal,
    pub hourly_rate: Decimal,
    pub monthly_retainer_fee: Decimal,
    pub rollover_months: i32,
    pub active_date: NaiveDate,
    pub termination_date: Option<NaiveDate>,
}

impl NewAgreement {
    /// Reject terms that would make invoicing ill-defined.
    pub fn validate(&self) -> Result<(), BillingError> {
        if self.monthly_retainer_hours < Decimal::ZERO {
            return Err(BillingError::Configuration(
                "monthly retainer hours must not be negative".to_string(),
            ));
        }
        if self.catch_up_threshold_hours < Decimal::ZERO
            || self.catch_up_threshold_hours > self.monthly_retainer_hours
        {
            return Err(BillingError::Configuration(format!(
                "catch-up threshold {} must be between 0 and the monthly retainer ({})",
                self.catch_up_threshold_hours, self.monthly_retainer_hours
            )));
        }
        if self.hourly_rate < Decimal::ZERO || self.monthly_retainer_fee < Decimal::ZERO {
            return Err(BillingError::Configuration(
                "hourly rate and retainer fee must not be negative".to_string(),
            ));
        }
        if self.rollover_months < 0 {
            return Err(BillingError::Configuration(
                "rollover months must not be negative".to_string(),
            ));
        }
        if let Some(end) = self.termination_date {
            if end < self.active_date {
                return Err(BillingError::Configuration(format!(
                    "termination date {} precedes active date {}",
                    end, self.active_date
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terms() -> NewAgreement {
        NewAgreement {
            company_id: 1,
            monthly_retainer_hours: dec(10),
            catch_up_threshold_hours: dec(2),
            hourly_rate: dec(150),
            monthly_retainer_fee: dec(1000),
            rollover_months: 3,
            active_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            termination_date: None,
        }
    }

    fn dec(value: i64) -> Decimal {
        Decimal::from(value)
    }

    #[test]
    fn accepts_threshold_within_retainer() {
        assert!(terms().validate().is_ok());

        let mut at_limit = terms();
        at_limit.catch_up_threshold_hours = dec(10);
        assert!(at_limit.validate().is_ok());
    }

    #[test]
    fn rejects_threshold_above_retainer() {
        let mut bad = terms();
        bad.catch_up_threshold_hours = dec(11);
        assert!(matches!(bad.validate(), Err(BillingError::Configuration(_))));
    }

    #[test]
    fn rejects_negative_threshold() {
        let mut bad = terms();
        bad.catch_up_threshold_hours = dec(-1);
        assert!(matches!(bad.validate(), Err(BillingError::Configuration(_))));
    }

    #[test]
    fn rejects_termination_before_activation() {
        let mut bad = terms();
        bad.termination_date = NaiveDate::from_ymd_opt(2023, 12, 31);
        assert!(matches!(bad.validate(), Err(BillingError::Configuration(_))));
    }
}
