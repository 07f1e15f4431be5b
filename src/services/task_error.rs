//! Task outcome taxonomy.
//!
//! Handlers return [`TaskError`]; the consumer turns every variant except
//! [`TaskError::Interrupted`] into a terminal task state.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Persisted and published classification of a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    TransientExhausted,
    InvalidInput,
    Unauthorized,
    QuotaExceeded,
    CostCeilingExceeded,
    Timeout,
    Cancelled,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("external API still failing after {attempts} attempts: {last}")]
    TransientExhausted { attempts: u32, last: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("external API rejected credentials: {0}")]
    Unauthorized(String),

    #[error("external API quota exhausted: {0}")]
    QuotaExceeded(String),

    #[error("task cost ${spent:.4} exceeds ceiling ${ceiling:.4}")]
    CostCeilingExceeded { spent: f64, ceiling: f64 },

    #[error("task did not finish within {0:?}")]
    TimedOut(Duration),

    #[error("task was cancelled")]
    Cancelled,

    /// Process shutdown interrupted the task. Not terminal: the stream entry
    /// stays pending and is redelivered.
    #[error("interrupted by shutdown")]
    Interrupted,

    #[error("internal error: {0}")]
    Internal(String),
}

impl TaskError {
    /// Kind recorded with the failed task. `Interrupted` is never recorded and
    /// reports `Internal`.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskError::TransientExhausted { .. } => ErrorKind::TransientExhausted,
            TaskError::InvalidInput(_) => ErrorKind::InvalidInput,
            TaskError::Unauthorized(_) => ErrorKind::Unauthorized,
            TaskError::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            TaskError::CostCeilingExceeded { .. } => ErrorKind::CostCeilingExceeded,
            TaskError::TimedOut(_) => ErrorKind::Timeout,
            TaskError::Cancelled => ErrorKind::Cancelled,
            TaskError::Interrupted | TaskError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Message shown to end users.
    pub fn user_message(&self) -> String {
        match self {
            TaskError::InvalidInput(detail) => format!("The document could not be processed: {detail}"),
            TaskError::CostCeilingExceeded { ceiling, .. } => format!(
                "This task needed more processing than its ${ceiling:.2} budget allows. Try a smaller document or narrower instructions."
            ),
            TaskError::Unauthorized(_) | TaskError::QuotaExceeded(_) => {
                "The processing service is not available right now. Please contact support.".to_string()
            }
            TaskError::Cancelled => "The task was cancelled.".to_string(),
            TaskError::TimedOut(_)
            | TaskError::TransientExhausted { .. }
            | TaskError::Interrupted
            | TaskError::Internal(_) => {
                "Something went wrong while processing this task. Please retry.".to_string()
            }
        }
    }
}
