//! Time record model.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A unit of tracked work.
///
/// `linked_line_id` is `None` while the work is unbilled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct TimeRecord {
    pub id: i64,
    pub company_id: i64,
    pub project_id: i64,
    pub task_id: Option<i64>,
    pub user_id: i64,
    pub description: String,
    pub job_type: Option<String>,
    pub minutes_worked: i64,
    pub date_worked: NaiveDate,
    pub is_billable: bool,
    pub linked_line_id: Option<i64>,
    pub created_utc: DateTime<Utc>,
}

/// Identity used to decide whether two fragments belong to the same work item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MergeKey {
    pub date_worked: NaiveDate,
    pub user_id: i64,
    pub description: String,
    pub project_id: i64,
    pub task_id: Option<i64>,
}

impl TimeRecord {
    pub fn merge_key(&self) -> MergeKey {
        MergeKey {
            date_worked: self.date_worked,
            user_id: self.user_id,
            description: self.description.clone(),
            project_id: self.project_id,
            task_id: self.task_id,
        }
    }

    pub fn is_linked(&self) -> bool {
        self.linked_line_id.is_some()
    }

    /// Copy of this record's identity carrying `minutes`, unlinked.
    pub fn overflow(&self, minutes: i64) -> NewTimeRecord {
        NewTimeRecord {
            company_id: self.company_id,
            project_id: self.project_id,
            task_id: self.task_id,
            user_id: self.user_id,
            description: self.description.clone(),
            job_type: self.job_type.clone(),
            minutes_worked: minutes,
            date_worked: self.date_worked,
            is_billable: self.is_billable,
            linked_line_id: None,
        }
    }
}

/// Input for creating a time record.
#[derive(Debug, Clone)]
pub struct NewTimeRecord {
    pub company_id: i64,
    pub project_id: i64,
    pub task_id: Option<i64>,
    pub user_id: i64,
    pub description: String,
    pub job_type: Option<String>,
    pub minutes_worked: i64,
    pub date_worked: NaiveDate,
    pub is_billable: bool,
    pub linked_line_id: Option<i64>,
}

/// Partial update of a time record.
#[derive(Debug, Clone, Default)]
pub struct UpdateTimeRecord {
    pub minutes_worked: Option<i64>,
    pub description: Option<String>,
    pub is_billable: Option<bool>,
}
