//! Task model: the canonical unit of work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// Lifecycle states of a task.
///
/// `Succeeded` and `Failed` are terminal; the engine never reopens them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Queued,
    Reserved,
    InProgress,
    RetryScheduled,
    Succeeded,
    Failed,
}

impl TaskStatus {
    /// Whether the engine may still act on a task in this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }
}

/// A persisted task record.
///
/// Owned by the [`TaskStore`](super::store::TaskStore); the executor only
/// ever holds short-lived snapshots of rows.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Task {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    #[serde(rename = "type")]
    pub task_type: String,

    /// Opaque to the engine; typing is the handler's responsibility.
    pub payload: Json<serde_json::Value>,

    #[builder(default)]
    pub status: TaskStatus,

    #[builder(default = 0)]
    pub attempts: i64,

    #[builder(default = 3)]
    pub max_attempts: i64,

    /// Higher runs first; ties break on `scheduled_for` ascending.
    #[builder(default = 0)]
    pub priority: i64,

    #[builder(default = Utc::now())]
    pub scheduled_for: DateTime<Utc>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,

    /// Doubles as the heartbeat; monotonically non-decreasing per task.
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,

    #[builder(default, setter(strip_option))]
    pub idempotency_key: Option<String>,

    #[builder(default, setter(strip_option))]
    pub last_error: Option<String>,

    #[builder(default, setter(strip_option))]
    pub result: Option<Json<serde_json::Value>>,
}

impl Task {
    /// Whether the task is eligible for reservation right now.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self.status,
            TaskStatus::Queued | TaskStatus::RetryScheduled
        ) && self.scheduled_for <= now
    }
}

/// Per-status queue counts, surfaced by `steward stats` and recorded into
/// the run record at shutdown.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: i64,
    pub reserved: i64,
    pub in_progress: i64,
    pub retry_scheduled: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub total: i64,
}

/// Final state of an executor run, persisted in the `runs` relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_task() -> Task {
        Task::builder()
            .task_type("noop")
            .payload(Json(json!({})))
            .build()
    }

    #[test]
    fn new_task_starts_queued_with_zero_attempts() {
        let task = sample_task();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.attempts, 0);
    }

    #[test]
    fn new_task_is_immediately_eligible() {
        let task = sample_task();
        assert!(task.is_eligible(Utc::now()));
    }

    #[test]
    fn future_schedule_blocks_eligibility() {
        let mut task = sample_task();
        task.scheduled_for = Utc::now() + chrono::Duration::hours(1);
        assert!(!task.is_eligible(Utc::now()));
    }

    #[test]
    fn retry_scheduled_is_eligible_once_due() {
        let mut task = sample_task();
        task.status = TaskStatus::RetryScheduled;
        task.scheduled_for = Utc::now() - chrono::Duration::seconds(1);
        assert!(task.is_eligible(Utc::now()));
    }

    #[test]
    fn terminal_states_are_never_eligible() {
        for status in [TaskStatus::Succeeded, TaskStatus::Failed] {
            let mut task = sample_task();
            task.status = status;
            assert!(status.is_terminal());
            assert!(!task.is_eligible(Utc::now()));
        }
    }

    #[test]
    fn reserved_and_in_progress_are_not_eligible() {
        for status in [TaskStatus::Reserved, TaskStatus::InProgress] {
            let mut task = sample_task();
            task.status = status;
            assert!(!task.is_eligible(Utc::now()));
        }
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&TaskStatus::RetryScheduled).unwrap();
        assert_eq!(json, "\"retry_scheduled\"");
    }
}
