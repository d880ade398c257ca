//! Merges unlinked fragments of the same work item back together.

use crate::error::Result;
use crate::models::{MergeKey, TimeRecord, UpdateTimeRecord};
use crate::services::repository::TimeRecordRepository;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument};

/// Recombine unlinked fragments of `company_id` within the caller's session.
///
/// A merge key is only consolidated when every record in the store carrying
/// that key is unlinked and all of them agree on billability. The lowest-id
/// record absorbs the minutes of the rest.
/// Returns the number of records eliminated.
#[instrument(skip(repo))]
pub async fn recombine_unlinked_fragments<R>(repo: &mut R, company_id: i64) -> Result<u64>
where
    R: TimeRecordRepository + ?Sized,
{
    let unlinked = repo.find_unlinked(company_id).await?;

    let mut groups: BTreeMap<MergeKey, Vec<TimeRecord>> = BTreeMap::new();
    for record in unlinked {
        groups.entry(record.merge_key()).or_default().push(record);
    }

    let mut eliminated = 0u64;
    for (key, mut members) in groups {
        if members.len() < 2 {
            continue;
        }
        if members
            .iter()
            .any(|record| record.is_billable != members[0].is_billable)
        {
            debug!(
                date_worked = %key.date_worked,
                user_id = key.user_id,
                "Skipping merge group with mixed billability"
            );
            continue;
        }

        let siblings = repo.find_by_merge_key(company_id, &key).await?;
        if siblings.iter().any(TimeRecord::is_linked) {
            debug!(
                date_worked = %key.date_worked,
                user_id = key.user_id,
                "Skipping merge group with linked sibling"
            );
            continue;
        }

        members.sort_by_key(|record| record.id);
        let total: i64 = members.iter().map(|record| record.minutes_worked).sum();
        let Some((keeper, rest)) = members.split_first() else {
            continue;
        };

        repo.update_record(
            keeper.id,
            &UpdateTimeRecord {
                minutes_worked: Some(total),
                ..Default::default()
            },
        )
        .await?;
        for record in rest {
            repo.delete_record(record.id).await?;
        }
        eliminated += rest.len() as u64;
    }

    if eliminated > 0 {
        info!(company_id, eliminated, "Unlinked fragments recombined");
    }

    Ok(eliminated)
}
