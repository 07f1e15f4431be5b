use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::{decode_payload, document_input, load_document, DocumentLimits, TaskContext, TaskHandler};
use crate::models::payload::EditPayload;
use crate::models::task::TaskType;
use crate::services::model_client::ModelRequest;
use crate::services::storage::DocumentSource;
use crate::services::task_error::TaskError;

const SYSTEM_PROMPT: &str = "You edit documents. Apply the user's instructions and reply with \
the complete edited document text only, without commentary.";

/// Applies free-text editing instructions to a document.
pub struct EditHandler {
    documents: Arc<dyn DocumentSource>,
    limits: DocumentLimits,
}

impl EditHandler {
    pub fn new(documents: Arc<dyn DocumentSource>, limits: DocumentLimits) -> Self {
        Self { documents, limits }
    }
}

#[async_trait]
impl TaskHandler for EditHandler {
    fn task_type(&self) -> TaskType {
        TaskType::Edit
    }

    async fn handle(
        &self,
        ctx: &TaskContext,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, TaskError> {
        let payload: EditPayload = decode_payload(payload)?;

        ctx.progress(20, "Loading document").await?;
        let document =
            load_document(self.documents.as_ref(), &payload.file_ref, self.limits, ctx.scope())
                .await?;

        ctx.progress(40, "Applying edits").await?;
        let completion = ctx
            .call_model(ModelRequest {
                system: SYSTEM_PROMPT.to_string(),
                prompt: format!("Instructions:\n{}", payload.instructions),
                document: Some(document_input(&document)),
                max_tokens: None,
            })
            .await?;

        ctx.progress(70, "Checking edited text").await?;
        let edited = completion.text.trim().to_string();
        if edited.is_empty() {
            return Err(TaskError::Internal("model returned an empty edit".to_string()));
        }

        ctx.progress(90, "Assembling result").await?;
        let result = json!({
            "file_ref": payload.file_ref,
            "edited_text": edited,
            "characters": edited.chars().count(),
        });

        ctx.progress(100, "Done").await?;
        Ok(result)
    }
}
