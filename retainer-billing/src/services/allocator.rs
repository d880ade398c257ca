//! Assigns worked minutes to capacity pools and splits straddling records.

use crate::error::{BillingError, Result};
use crate::hours::{hours_to_minutes, minutes_to_hours, round_hours};
use crate::models::{AllocationType, TimeFragment, TimeRecord, UpdateTimeRecord};
use crate::services::repository::TimeRecordRepository;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, instrument};

/// Result of distributing records across the four pools.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AllocationPlan {
    pub prior_month_retainer: Vec<TimeFragment>,
    pub current_month_retainer: Vec<TimeFragment>,
    pub catch_up: Vec<TimeFragment>,
    pub billable_catchup: Vec<TimeFragment>,
    pub prior_month_hours: Decimal,
    pub current_month_hours: Decimal,
    pub catch_up_hours: Decimal,
    pub billable_catchup_hours: Decimal,
    /// Capacity of the catch-up pool.
    pub catch_up_needed_hours: Decimal,
    /// Retainer capacity left once every record is placed.
    pub remaining_capacity_hours: Decimal,
    /// Extra hours billed so that the remaining capacity reaches the threshold.
    pub buffer_restoration_hours: Decimal,
}

impl AllocationPlan {
    pub fn fragments(&self, pool: AllocationType) -> &[TimeFragment] {
        match pool {
            AllocationType::PriorMonthRetainer => &self.prior_month_retainer,
            AllocationType::CurrentMonthRetainer => &self.current_month_retainer,
            AllocationType::CatchUp => &self.catch_up,
            AllocationType::BillableCatchup => &self.billable_catchup,
        }
    }

    fn fragments_mut(&mut self, pool: AllocationType) -> &mut Vec<TimeFragment> {
        match pool {
            AllocationType::PriorMonthRetainer => &mut self.prior_month_retainer,
            AllocationType::CurrentMonthRetainer => &mut self.current_month_retainer,
            AllocationType::CatchUp => &mut self.catch_up,
            AllocationType::BillableCatchup => &mut self.billable_catchup,
        }
    }

    /// Fragments grouped per original record, in pool order.
    pub fn fragments_by_record(&self) -> BTreeMap<i64, Vec<&TimeFragment>> {
        let mut grouped: BTreeMap<i64, Vec<&TimeFragment>> = BTreeMap::new();
        for pool in AllocationType::ORDER {
            for fragment in self.fragments(pool) {
                grouped.entry(fragment.original_record_id).or_default().push(fragment);
            }
        }
        grouped
    }

    pub fn total_minutes(&self) -> i64 {
        AllocationType::ORDER
            .iter()
            .flat_map(|pool| self.fragments(*pool))
            .map(|fragment| fragment.minutes)
            .sum()
    }

    /// Hours billed at the hourly rate, buffer restoration included.
    pub fn billable_hours(&self) -> Decimal {
        round_hours(self.catch_up_hours + self.billable_catchup_hours + self.buffer_restoration_hours)
    }
}

/// Distribute `records` across the pools.
///
/// Records are processed in `(date_worked, id)` order; each one drains prior
/// retainer, current retainer, catch-up and finally the unbounded billable pool.
pub fn allocate(
    records: &[TimeRecord],
    prior_month_capacity_hours: Decimal,
    current_month_capacity_hours: Decimal,
    catch_up_threshold_hours: Decimal,
) -> AllocationPlan {
    let mut ordered: Vec<&TimeRecord> = records.iter().collect();
    ordered.sort_by_key(|record| (record.date_worked, record.id));

    let prior = hours_to_minutes(prior_month_capacity_hours.max(Decimal::ZERO));
    let current = hours_to_minutes(current_month_capacity_hours.max(Decimal::ZERO));
    let threshold = hours_to_minutes(catch_up_threshold_hours.max(Decimal::ZERO));
    let catch_up_needed = (threshold - (prior + current)).max(0);

    let mut capacity = [prior, current, catch_up_needed, i64::MAX];
    let mut plan = AllocationPlan::default();

    for record in ordered {
        let mut remaining = record.minutes_worked.max(0);
        for (slot, pool) in AllocationType::ORDER.into_iter().enumerate() {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(capacity[slot]);
            if take == 0 {
                continue;
            }
            capacity[slot] -= take;
            remaining -= take;
            plan.fragments_mut(pool).push(TimeFragment {
                original_record_id: record.id,
                minutes: take,
                date_worked: record.date_worked,
                allocation_type: pool,
            });
        }
    }

    let pool_minutes =
        |pool: AllocationType| -> i64 { plan.fragments(pool).iter().map(|f| f.minutes).sum() };
    let prior_minutes = pool_minutes(AllocationType::PriorMonthRetainer);
    let current_minutes = pool_minutes(AllocationType::CurrentMonthRetainer);
    let catch_up_minutes = pool_minutes(AllocationType::CatchUp);
    let billable_minutes = pool_minutes(AllocationType::BillableCatchup);
    let remaining_capacity = capacity[0] + capacity[1];
    let restoration = ((threshold - remaining_capacity).max(0) - catch_up_minutes).max(0);

    plan.prior_month_hours = minutes_to_hours(prior_minutes);
    plan.current_month_hours = minutes_to_hours(current_minutes);
    plan.catch_up_hours = minutes_to_hours(catch_up_minutes);
    plan.billable_catchup_hours = minutes_to_hours(billable_minutes);
    plan.catch_up_needed_hours = minutes_to_hours(catch_up_needed);
    plan.remaining_capacity_hours = minutes_to_hours(remaining_capacity);
    plan.buffer_restoration_hours = minutes_to_hours(restoration);
    plan
}

/// Physically split `record` into a primary of `split_at_minutes` and an unlinked overflow.
///
/// Both writes go through the caller's session, so they commit or roll back together.
#[instrument(skip(repo, record), fields(record_id = %record.id, split_at = split_at_minutes))]
pub async fn split_entry<R>(
    repo: &mut R,
    record: &TimeRecord,
    split_at_minutes: i64,
) -> Result<(TimeRecord, TimeRecord)>
where
    R: TimeRecordRepository + ?Sized,
{
    if split_at_minutes <= 0 || split_at_minutes >= record.minutes_worked {
        return Err(BillingError::InvalidSplitPoint {
            record_id: record.id,
            split_at: split_at_minutes,
            minutes_worked: record.minutes_worked,
        });
    }

    let primary = repo
        .update_record(
            record.id,
            &UpdateTimeRecord {
                minutes_worked: Some(split_at_minutes),
                ..Default::default()
            },
        )
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("time record {}", record.id)))?;

    let overflow = repo
        .create_record(&record.overflow(record.minutes_worked - split_at_minutes))
        .await?;

    debug!(
        primary_id = primary.id,
        overflow_id = overflow.id,
        primary_minutes = primary.minutes_worked,
        overflow_minutes = overflow.minutes_worked,
        "Time record split"
    );

    Ok((primary, overflow))
}
