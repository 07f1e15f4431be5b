//! Type-specific task payloads.
//!
//! Each handler decodes its own payload with [`decode`], so adding a task type
//! only adds a struct here and never touches the existing ones.

use garde::Validate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::task::TaskType;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ParsePayload {
    /// Object key of the uploaded document.
    #[garde(length(min = 1, max = 1024))]
    pub file_ref: String,

    /// Optional list of field names the caller is interested in.
    #[serde(default)]
    #[garde(length(max = 64), inner(length(min = 1, max = 128)))]
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct EditPayload {
    #[garde(length(min = 1, max = 1024))]
    pub file_ref: String,

    #[garde(length(min = 1, max = 8000))]
    pub instructions: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ReviewPayload {
    #[garde(length(min = 1, max = 1024))]
    pub file_ref: String,

    #[serde(default)]
    #[garde(length(max = 8000))]
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct GeneratePayload {
    #[garde(length(min = 1, max = 128))]
    pub template_id: String,

    #[serde(default)]
    #[garde(length(min = 1, max = 128))]
    pub customer_id: Option<String>,

    #[serde(default)]
    #[garde(length(max = 8000))]
    pub instructions: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("payload is not valid for this task type: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("payload failed validation: {0}")]
    Invalid(String),
}

/// Deserialize and validate a payload.
pub fn decode<T>(value: &serde_json::Value) -> Result<T, PayloadError>
where
    T: DeserializeOwned + Validate,
    T::Context: Default,
{
    let payload: T = serde_json::from_value(value.clone())?;
    payload
        .validate()
        .map_err(|report| PayloadError::Invalid(report.to_string()))?;
    Ok(payload)
}

/// Validate a raw payload against the shape expected for `task_type`.
pub fn validate_for(task_type: TaskType, value: &serde_json::Value) -> Result<(), PayloadError> {
    match task_type {
        TaskType::Parse => decode::<ParsePayload>(value).map(|_| ()),
        TaskType::Edit => decode::<EditPayload>(value).map(|_| ()),
        TaskType::Review => decode::<ReviewPayload>(value).map(|_| ()),
        TaskType::Generate => decode::<GeneratePayload>(value).map(|_| ()),
    }
}
