//! Opening/closing hour balances for retainer periods.
//!
//! Everything here is pure: callers pass the full history they want
//! considered and get rounded figures back.

use crate::hours::round_hours;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};

/// Hours available at the start of a period.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OpeningBalance {
    pub retainer_hours: Decimal,
    pub rollover_hours: Decimal,
    pub expired_hours: Decimal,
    pub negative_offset: Decimal,
    pub effective_retainer_hours: Decimal,
    pub total_available: Decimal,
    /// Negative balance beyond this period's retainer. Informational, never charged.
    pub invoiced_negative_balance: Decimal,
    pub remaining_negative_balance: Decimal,
}

/// How worked hours were absorbed by a period.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClosingBalance {
    pub hours_used_from_retainer: Decimal,
    pub hours_used_from_rollover: Decimal,
    pub unused_hours: Decimal,
    pub excess_hours: Decimal,
    pub negative_balance: Decimal,
    pub remaining_rollover: Decimal,
}

/// Compute the opening balance for a period.
///
/// `previous_months_unused` maps months-ago (1 = the previous period) to the
/// unused hours still recorded for that period.
pub fn calculate_opening_balance(
    retainer_hours: Decimal,
    previous_months_unused: &BTreeMap<u32, Decimal>,
    rollover_months: u32,
    previous_negative_balance: Decimal,
) -> OpeningBalance {
    let mut rollover_hours = Decimal::ZERO;
    let mut expired_hours = Decimal::ZERO;
    for (&months_ago, &hours) in previous_months_unused {
        if (1..=rollover_months).contains(&months_ago) {
            rollover_hours += hours;
        } else {
            expired_hours += hours;
        }
    }

    let previous_negative_balance = previous_negative_balance.max(Decimal::ZERO);
    let negative_offset = previous_negative_balance.min(retainer_hours);
    let effective_retainer_hours = retainer_hours - negative_offset;
    let remaining_negative_balance = (previous_negative_balance - retainer_hours).max(Decimal::ZERO);

    OpeningBalance {
        retainer_hours: round_hours(retainer_hours),
        rollover_hours: round_hours(rollover_hours),
        expired_hours: round_hours(expired_hours),
        negative_offset: round_hours(negative_offset),
        effective_retainer_hours: round_hours(effective_retainer_hours),
        total_available: round_hours(effective_retainer_hours + rollover_hours),
        invoiced_negative_balance: round_hours(remaining_negative_balance),
        remaining_negative_balance: round_hours(remaining_negative_balance),
    }
}

/// Compute how `hours_worked` is absorbed.
///
/// Overage beyond `total_available` becomes billable `excess_hours` only when
/// `bill_excess_immediately` is set; otherwise it is carried as negative balance.
pub fn calculate_closing_balance(
    total_available: Decimal,
    hours_worked: Decimal,
    retainer_hours: Decimal,
    rollover_hours: Decimal,
    bill_excess_immediately: bool,
    remaining_negative_balance: Decimal,
) -> ClosingBalance {
    let mut negative_balance = remaining_negative_balance;

    let (from_retainer, from_rollover, unused, excess) = if hours_worked <= retainer_hours {
        (hours_worked, Decimal::ZERO, retainer_hours - hours_worked, Decimal::ZERO)
    } else if hours_worked <= total_available {
        (retainer_hours, hours_worked - retainer_hours, Decimal::ZERO, Decimal::ZERO)
    } else {
        let overage = hours_worked - total_available;
        let from_rollover = (total_available - retainer_hours).max(Decimal::ZERO);
        if bill_excess_immediately {
            (retainer_hours, from_rollover, Decimal::ZERO, overage)
        } else {
            negative_balance += overage;
            (retainer_hours, from_rollover, Decimal::ZERO, Decimal::ZERO)
        }
    };

    ClosingBalance {
        hours_used_from_retainer: round_hours(from_retainer),
        hours_used_from_rollover: round_hours(from_rollover),
        unused_hours: round_hours(unused),
        excess_hours: round_hours(excess),
        negative_balance: round_hours(negative_balance),
        remaining_rollover: round_hours((rollover_hours - from_rollover).max(Decimal::ZERO)),
    }
}

/// Unused hours recorded for one period.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub period_key: String,
    /// Month position; months-ago is the difference between two positions.
    pub month: i32,
    pub hours: Decimal,
}

/// FIFO ledger of unused hours, oldest first.
#[derive(Debug, Clone, Default)]
pub struct RolloverLedger {
    entries: VecDeque<LedgerEntry>,
}

impl RolloverLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.entries.iter()
    }

    /// Unused hours keyed by months-ago relative to `current_month`.
    pub fn unused_by_months_ago(&self, current_month: i32) -> BTreeMap<u32, Decimal> {
        let mut unused = BTreeMap::new();
        for entry in &self.entries {
            let months_ago = current_month - entry.month;
            if months_ago >= 1 && entry.hours > Decimal::ZERO {
                *unused.entry(months_ago as u32).or_insert(Decimal::ZERO) += entry.hours;
            }
        }
        unused
    }

    /// Drain `hours` from eligible entries, oldest first. Returns what could not be drained.
    pub fn consume(&mut self, current_month: i32, rollover_months: u32, hours: Decimal) -> Decimal {
        let mut remaining = hours;
        for entry in self.entries.iter_mut() {
            if remaining <= Decimal::ZERO {
                break;
            }
            let months_ago = current_month - entry.month;
            if months_ago < 1 || months_ago as u32 > rollover_months {
                continue;
            }
            let take = remaining.min(entry.hours);
            entry.hours = round_hours(entry.hours - take);
            remaining -= take;
        }
        self.entries.retain(|entry| entry.hours > Decimal::ZERO);
        round_hours(remaining.max(Decimal::ZERO))
    }

    pub fn record(&mut self, period_key: impl Into<String>, month: i32, hours: Decimal) {
        if hours > Decimal::ZERO {
            self.entries.push_back(LedgerEntry {
                period_key: period_key.into(),
                month,
                hours: round_hours(hours),
            });
        }
    }

    /// Drop entries older than `rollover_months + 1` relative to `next_month`.
    ///
    /// One extra month is kept so the following period can report the expiry.
    pub fn prune(&mut self, next_month: i32, rollover_months: u32) {
        let horizon = rollover_months as i32 + 1;
        self.entries.retain(|entry| next_month - entry.month <= horizon);
    }
}

/// One period fed to [`calculate_multiple_months`].
#[derive(Debug, Clone)]
pub struct MonthInput {
    pub period_key: String,
    pub retainer_hours: Decimal,
    pub hours_worked: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthSummary {
    pub period_key: String,
    pub opening: OpeningBalance,
    pub closing: ClosingBalance,
}

/// Fold opening and closing balances over consecutive periods.
pub fn calculate_multiple_months(
    months: &[MonthInput],
    rollover_months: u32,
    bill_excess_immediately: bool,
) -> Vec<MonthSummary> {
    let mut ledger = RolloverLedger::new();
    let mut negative_balance = Decimal::ZERO;
    let mut summaries = Vec::with_capacity(months.len());

    for (position, month) in months.iter().enumerate() {
        let current = position as i32;
        let opening = calculate_opening_balance(
            month.retainer_hours,
            &ledger.unused_by_months_ago(current),
            rollover_months,
            negative_balance,
        );
        let closing = calculate_closing_balance(
            opening.total_available,
            month.hours_worked,
            opening.effective_retainer_hours,
            opening.rollover_hours,
            bill_excess_immediately,
            opening.remaining_negative_balance,
        );

        ledger.consume(current, rollover_months, closing.hours_used_from_rollover);
        ledger.record(month.period_key.clone(), current, closing.unused_hours);
        ledger.prune(current + 1, rollover_months);
        negative_balance = closing.negative_balance;

        summaries.push(MonthSummary {
            period_key: month.period_key.clone(),
            opening,
            closing,
        });
    }

    summaries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(value: i64) -> Decimal {
        Decimal::from(value)
    }

    fn month(key: &str, retainer: i64, worked: i64) -> MonthInput {
        MonthInput {
            period_key: key.to_string(),
            retainer_hours: h(retainer),
            hours_worked: h(worked),
        }
    }

    #[test]
    fn opening_splits_rollover_from_expired() {
        let unused = BTreeMap::from([(1, h(3)), (2, h(2)), (3, h(4))]);
        let opening = calculate_opening_balance(h(10), &unused, 2, Decimal::ZERO);

        assert_eq!(opening.rollover_hours, h(5));
        assert_eq!(opening.expired_hours, h(4));
        assert_eq!(opening.total_available, h(15));
    }

    #[test]
    fn zero_rollover_months_expires_everything() {
        let unused = BTreeMap::from([(1, h(3))]);
        let opening = calculate_opening_balance(h(10), &unused, 0, Decimal::ZERO);

        assert_eq!(opening.rollover_hours, Decimal::ZERO);
        assert_eq!(opening.expired_hours, h(3));
        assert_eq!(opening.total_available, h(10));
    }

    #[test]
    fn negative_balance_offsets_retainer() {
        let opening = calculate_opening_balance(h(10), &BTreeMap::new(), 2, h(15));

        assert_eq!(opening.negative_offset, h(10));
        assert_eq!(opening.effective_retainer_hours, Decimal::ZERO);
        assert_eq!(opening.invoiced_negative_balance, h(5));
        assert_eq!(opening.remaining_negative_balance, h(5));
        assert_eq!(opening.total_available, Decimal::ZERO);
    }

    #[test]
    fn partial_negative_offset() {
        let opening = calculate_opening_balance(h(10), &BTreeMap::new(), 2, h(4));

        assert_eq!(opening.negative_offset, h(4));
        assert_eq!(opening.effective_retainer_hours, h(6));
        assert_eq!(opening.remaining_negative_balance, Decimal::ZERO);
    }

    #[test]
    fn closing_within_retainer() {
        let closing = calculate_closing_balance(h(14), h(8), h(10), h(4), false, Decimal::ZERO);

        assert_eq!(closing.hours_used_from_retainer, h(8));
        assert_eq!(closing.hours_used_from_rollover, Decimal::ZERO);
        assert_eq!(closing.unused_hours, h(2));
        assert_eq!(closing.remaining_rollover, h(4));
    }

    #[test]
    fn closing_draws_on_rollover() {
        let closing = calculate_closing_balance(h(14), h(12), h(10), h(4), false, Decimal::ZERO);

        assert_eq!(closing.hours_used_from_retainer, h(10));
        assert_eq!(closing.hours_used_from_rollover, h(2));
        assert_eq!(closing.unused_hours, Decimal::ZERO);
        assert_eq!(closing.remaining_rollover, h(2));
        assert_eq!(closing.excess_hours, Decimal::ZERO);
    }

    #[test]
    fn overage_is_carried_not_billed() {
        let closing =
            calculate_closing_balance(h(10), h(12), h(10), Decimal::ZERO, false, Decimal::ZERO);

        assert_eq!(closing.excess_hours, Decimal::ZERO);
        assert_eq!(closing.negative_balance, h(2));
    }

    #[test]
    fn overage_billed_when_requested() {
        let closing = calculate_closing_balance(h(10), h(13), h(10), Decimal::ZERO, true, h(1));

        assert_eq!(closing.excess_hours, h(3));
        assert_eq!(closing.negative_balance, h(1));
    }

    #[test]
    fn carried_overage_accumulates_on_remaining_negative() {
        let closing = calculate_closing_balance(h(0), h(3), h(0), Decimal::ZERO, false, h(5));

        assert_eq!(closing.negative_balance, h(8));
        assert_eq!(closing.hours_used_from_retainer, Decimal::ZERO);
    }

    #[test]
    fn rollover_fifo_covers_exact_overage() {
        let summaries = calculate_multiple_months(
            &[month("2024-01", 10, 6), month("2024-02", 10, 14)],
            2,
            false,
        );

        assert_eq!(summaries[0].closing.unused_hours, h(4));
        assert_eq!(summaries[1].opening.rollover_hours, h(4));
        assert_eq!(summaries[1].closing.hours_used_from_rollover, h(4));
        assert_eq!(summaries[1].closing.excess_hours, Decimal::ZERO);
        assert_eq!(summaries[1].closing.negative_balance, Decimal::ZERO);
    }

    #[test]
    fn oldest_hours_are_drained_first_and_expire() {
        let summaries = calculate_multiple_months(
            &[
                month("m1", 10, 7),
                month("m2", 10, 8),
                month("m3", 10, 12),
                month("m4", 10, 10),
                month("m5", 10, 10),
            ],
            3,
            false,
        );

        // m3 uses 2h: all from m1 (3h -> 1h), m2 untouched.
        assert_eq!(summaries[2].opening.rollover_hours, h(5));
        assert_eq!(summaries[2].closing.hours_used_from_rollover, h(2));
        assert_eq!(summaries[3].opening.rollover_hours, h(3));
        // m1 is now four months back and expires.
        assert_eq!(summaries[4].opening.expired_hours, h(1));
        assert_eq!(summaries[4].opening.rollover_hours, h(2));
    }

    #[test]
    fn negative_balance_carries_into_next_month() {
        let summaries = calculate_multiple_months(
            &[month("m1", 10, 12), month("m2", 10, 5)],
            0,
            false,
        );

        assert_eq!(summaries[0].closing.negative_balance, h(2));
        assert_eq!(summaries[1].opening.negative_offset, h(2));
        assert_eq!(summaries[1].opening.effective_retainer_hours, h(8));
        assert_eq!(summaries[1].closing.unused_hours, h(3));
        assert_eq!(summaries[1].closing.negative_balance, Decimal::ZERO);
    }

    #[test]
    fn ledger_prunes_past_reporting_horizon() {
        let mut ledger = RolloverLedger::new();
        ledger.record("m0", 0, h(2));
        ledger.prune(2, 1);
        assert_eq!(ledger.entries().count(), 1);
        ledger.prune(3, 1);
        assert_eq!(ledger.entries().count(), 0);
    }
}
