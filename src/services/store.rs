use async_trait::async_trait;
use uuid::Uuid;

use crate::models::task::{Task, TaskOutcome};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt task record {task_id}: {detail}")]
    Corrupt { task_id: Uuid, detail: String },
}

/// Outcome of a cancel request.
#[derive(Debug, Clone)]
pub struct CancelRequest {
    /// The record after the request.
    pub task: Task,
    /// This request moved the task from pending to cancelled.
    pub cancelled_now: bool,
}

/// Durable task records. The source of truth for task state.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Insert a pending task. Inserting an existing id is a no-op.
    async fn create(&self, task: &Task) -> Result<(), StoreError>;

    async fn get(&self, task_id: Uuid) -> Result<Option<Task>, StoreError>;

    /// Move a pending or processing task into `processing` and return the
    /// current record. Terminal and cancel-requested records are returned
    /// unchanged. `None` if the task does not exist.
    async fn begin(&self, task_id: Uuid) -> Result<Option<Task>, StoreError>;

    /// Best-effort progress snapshot for status queries, tagged with the
    /// message sequence number. Never lowers progress or sequence.
    async fn record_progress(
        &self,
        task_id: Uuid,
        progress: u8,
        step: &str,
        seq: u64,
    ) -> Result<(), StoreError>;

    /// Single idempotent terminal write. Returns `false` (and changes
    /// nothing) if the task was already terminal.
    async fn save_result(&self, outcome: &TaskOutcome) -> Result<bool, StoreError>;

    /// Cancel a pending task outright, or flag a processing one.
    async fn request_cancel(&self, task_id: Uuid) -> Result<Option<CancelRequest>, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
