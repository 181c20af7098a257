//! Task data model for the generic worker pool (C9).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Scheduling priority. Declaration order doubles as numeric rank
/// (`High` = 0), matching the spec's explicit `{High=0, Normal=1, Low=2}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    High = 0,
    Normal = 1,
    Low = 2,
}

/// Lifecycle status. Terminal states are `Completed`, `Failed`, `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Cancelled)
    }
}

/// One unit of work. `id` is required and unique while the task is
/// in-flight; the task is removed from the dispatcher's map the moment it
/// reaches a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub priority: Priority,
    pub payload: Value,
    pub status: Status,
    pub error: Option<String>,
    pub result: Option<Value>,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Builds a task in its initial `Pending` state; the dispatcher stamps
    /// `created_at` at submit time.
    pub fn new(id: impl Into<String>, priority: Priority, payload: Value) -> Self {
        Self {
            id: id.into(),
            priority,
            payload,
            status: Status::Pending,
            error: None,
            result: None,
            created_at: None,
            started_at: None,
            completed_at: None,
        }
    }
}

/// One failed-task record, kept in the dispatcher's bounded ring buffer.
#[derive(Debug, Clone)]
pub struct TaskExecutionError {
    pub task_id: String,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}
