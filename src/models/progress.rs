use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::services::task_error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    ProgressUpdate,
    TaskComplete,
    TaskError,
}

/// Message published on the live progress channel for one task.
///
/// `task_complete` and `task_error` are terminal and always the last message
/// for a given `task_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressMessage {
    pub task_id: Uuid,
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Per-task sequence number, strictly increasing in publish order.
    pub seq: u64,
    pub progress: u8,
    pub current_step: String,
    pub elapsed_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl ProgressMessage {
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, MessageType::TaskComplete | MessageType::TaskError)
    }
}

/// Redis pub/sub channel carrying progress for `task_id`.
pub fn progress_channel(task_id: Uuid) -> String {
    format!("docflow:progress:{task_id}")
}
