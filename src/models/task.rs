use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::services::task_error::ErrorKind;

/// Kind of work a task performs. Determines which stream and handler it is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskType {
    Parse,
    Edit,
    Review,
    Generate,
}

/// Lifecycle status of a task.
///
/// `pending -> processing -> {completed, failed}`; `cancelled` is reachable from
/// `pending` or `processing`. Terminal states are never reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether moving from `self` to `next` is a legal lifecycle transition.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Processing) | (Pending, Cancelled) => true,
            // Redelivery of a non-terminal task re-enters processing.
            (Processing, Processing) => true,
            (Processing, Completed) | (Processing, Failed) | (Processing, Cancelled) => true,
            _ => false,
        }
    }
}

/// A task record as persisted in the result store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    pub progress: u8,
    pub current_step: Option<String>,
    /// Sequence number of the last recorded progress update.
    #[serde(default)]
    pub progress_seq: u64,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub cost: f64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub duration_secs: f64,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// A fresh pending task, as created when a caller enqueues work.
    pub fn new(id: Uuid, task_type: TaskType, payload: serde_json::Value) -> Self {
        Self {
            id,
            task_type,
            payload,
            status: TaskStatus::Pending,
            progress: 0,
            current_step: None,
            progress_seq: 0,
            result: None,
            error: None,
            error_kind: None,
            cost: 0.0,
            tokens_in: 0,
            tokens_out: 0,
            duration_secs: 0.0,
            cancel_requested: false,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// Token and cost totals for one task, accumulated across its outbound calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Accounting {
    pub cost: f64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub calls: u32,
}

/// Terminal outcome of a task, written once through `ResultStore::save_result`.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub accounting: Accounting,
    pub duration_secs: f64,
}

impl TaskOutcome {
    pub fn completed(
        task_id: Uuid,
        result: serde_json::Value,
        accounting: Accounting,
        duration_secs: f64,
    ) -> Self {
        Self {
            task_id,
            status: TaskStatus::Completed,
            result: Some(result),
            error: None,
            error_kind: None,
            accounting,
            duration_secs,
        }
    }

    pub fn failed(
        task_id: Uuid,
        kind: ErrorKind,
        message: String,
        accounting: Accounting,
        duration_secs: f64,
    ) -> Self {
        let status = if kind == ErrorKind::Cancelled {
            TaskStatus::Cancelled
        } else {
            TaskStatus::Failed
        };
        Self {
            task_id,
            status,
            result: None,
            error: Some(message),
            error_kind: Some(kind),
            accounting,
            duration_secs,
        }
    }
}
