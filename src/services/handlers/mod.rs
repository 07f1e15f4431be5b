//! Per-type task handlers.
//!
//! A handler is a stateless value: everything it needs for one run arrives in
//! the [`TaskContext`], so a single instance serves any number of concurrent
//! tasks. New task types register a new handler with the dispatcher and leave
//! the existing ones untouched.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use super::cancel::CancelScope;
use super::dispatcher::{DispatchError, Dispatcher};
use super::model_client::{DocumentInput, ModelRequest};
use super::progress::ProgressReporter;
use super::queue::{stream_name, DEFAULT_GROUP};
use super::retry::{Completion, Ledger, RetryingClient};
use super::storage::{Document, DocumentSource, StorageError};
use super::task_error::TaskError;
use crate::models::payload::{self, PayloadError};
use crate::models::task::{Accounting, TaskType};

pub mod edit;
pub mod generate;
pub mod parse;
pub mod review;

#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn task_type(&self) -> TaskType;

    /// Run the task. Milestones are reported through `ctx`; the terminal
    /// message is published by the consumer once the outcome is saved.
    async fn handle(
        &self,
        ctx: &TaskContext,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, TaskError>;
}

/// Everything a handler may use for one task run.
pub struct TaskContext {
    task_id: Uuid,
    trace_id: String,
    client: Arc<RetryingClient>,
    ledger: Arc<Ledger>,
    reporter: Arc<ProgressReporter>,
    scope: CancelScope,
}

impl TaskContext {
    pub fn new(
        task_id: Uuid,
        trace_id: String,
        client: Arc<RetryingClient>,
        ledger: Arc<Ledger>,
        reporter: Arc<ProgressReporter>,
        scope: CancelScope,
    ) -> Self {
        Self {
            task_id,
            trace_id,
            client,
            ledger,
            reporter,
            scope,
        }
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Report a milestone. Fails instead if the task has been cancelled,
    /// including a cancel request recorded only in the store.
    pub async fn progress(&self, progress: u8, step: &str) -> Result<(), TaskError> {
        self.checkpoint()?;
        if self.reporter.cancel_requested().await {
            self.scope.cancel_task();
            return Err(TaskError::Cancelled);
        }
        self.reporter.update(progress, step).await;
        Ok(())
    }

    /// Cancellation check between milestones.
    pub fn checkpoint(&self) -> Result<(), TaskError> {
        self.scope.check()
    }

    pub async fn call_model(&self, request: ModelRequest) -> Result<Completion, TaskError> {
        self.client.invoke(request, &self.ledger, &self.scope).await
    }

    pub fn accounting(&self) -> Accounting {
        self.ledger.snapshot()
    }

    pub fn scope(&self) -> &CancelScope {
        &self.scope
    }
}

/// Limits applied to documents before they are sent to the model.
#[derive(Debug, Clone, Copy)]
pub struct DocumentLimits {
    pub max_bytes: usize,
}

impl Default for DocumentLimits {
    fn default() -> Self {
        Self {
            max_bytes: 20 * 1024 * 1024,
        }
    }
}

const SUPPORTED_EXTENSIONS: &[&str] = &["pdf", "docx", "doc", "txt", "md", "html"];

/// Fetch and vet a referenced document.
pub(crate) async fn load_document(
    documents: &dyn DocumentSource,
    file_ref: &str,
    limits: DocumentLimits,
    scope: &CancelScope,
) -> Result<Document, TaskError> {
    let extension = file_extension(file_ref);
    if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
        let shown = if extension.is_empty() {
            "(none)".to_string()
        } else {
            format!(".{extension}")
        };
        return Err(TaskError::InvalidInput(format!(
            "unsupported file type {shown}; supported types are PDF, Word, text, Markdown and HTML"
        )));
    }

    let document = match scope.run(documents.fetch(file_ref)).await? {
        Ok(document) => document,
        Err(StorageError::NotFound(_)) => {
            return Err(TaskError::InvalidInput(format!(
                "the document {file_ref:?} was not found"
            )))
        }
        Err(e) => return Err(TaskError::Internal(format!("fetching {file_ref}: {e}"))),
    };

    if document.bytes.is_empty() {
        return Err(TaskError::InvalidInput("the document is empty".to_string()));
    }
    if document.bytes.len() > limits.max_bytes {
        return Err(TaskError::InvalidInput(format!(
            "the document is {} MB; the limit is {} MB",
            document.bytes.len().div_ceil(1024 * 1024),
            limits.max_bytes / (1024 * 1024)
        )));
    }
    Ok(document)
}

fn file_extension(file_ref: &str) -> String {
    Path::new(file_ref)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default()
}

/// Model input for a vetted document. Text formats go inline.
pub(crate) fn document_input(document: &Document) -> DocumentInput {
    let extension = file_extension(&document.file_ref);
    match extension.as_str() {
        "txt" | "md" | "html" => {
            DocumentInput::Text(String::from_utf8_lossy(&document.bytes).into_owned())
        }
        _ => DocumentInput::Binary {
            media_type: document
                .content_type
                .clone()
                .unwrap_or_else(|| media_type_for(&extension).to_string()),
            bytes: document.bytes.clone(),
        },
    }
}

fn media_type_for(extension: &str) -> &'static str {
    match extension {
        "pdf" => "application/pdf",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "doc" => "application/msword",
        _ => "application/octet-stream",
    }
}

/// Pull the JSON object out of a model reply, tolerating prose or code fences around it.
pub(crate) fn extract_json(text: &str) -> Result<serde_json::Value, TaskError> {
    let start = text.find('{');
    let end = text.rfind('}');
    let candidate = match (start, end) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => {
            return Err(TaskError::Internal(
                "model reply contained no JSON object".to_string(),
            ))
        }
    };
    serde_json::from_str(candidate)
        .map_err(|e| TaskError::Internal(format!("model reply was not valid JSON: {e}")))
}

/// Decode a typed payload, mapping failures to user-facing input errors.
pub(crate) fn decode_payload<T>(value: &serde_json::Value) -> Result<T, TaskError>
where
    T: serde::de::DeserializeOwned + garde::Validate,
    T::Context: Default,
{
    payload::decode(value).map_err(|e| match e {
        PayloadError::Malformed(e) => TaskError::InvalidInput(format!("bad task payload: {e}")),
        PayloadError::Invalid(report) => TaskError::InvalidInput(report),
    })
}

/// Register the built-in handlers, one stream per task type.
pub fn register_defaults(
    dispatcher: &mut Dispatcher,
    documents: Arc<dyn DocumentSource>,
    limits: DocumentLimits,
) -> Result<(), DispatchError> {
    let handlers: Vec<Arc<dyn TaskHandler>> = vec![
        Arc::new(parse::ParseHandler::new(documents.clone(), limits)),
        Arc::new(edit::EditHandler::new(documents.clone(), limits)),
        Arc::new(review::ReviewHandler::new(documents, limits)),
        Arc::new(generate::GenerateHandler),
    ];
    for handler in handlers {
        let task_type = handler.task_type();
        dispatcher.register(task_type, stream_name(task_type), DEFAULT_GROUP, handler)?;
    }
    Ok(())
}
