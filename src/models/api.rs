use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::{TaskStatus, TaskType};

/// Body of `POST /api/v1/tasks`.
#[derive(Debug, Deserialize)]
pub struct SubmitTaskRequest {
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitTaskResponse {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub entry_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelTaskResponse {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub cancel_requested: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
