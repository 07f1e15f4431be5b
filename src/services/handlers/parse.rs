use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::{
    decode_payload, document_input, extract_json, load_document, DocumentLimits, TaskContext,
    TaskHandler,
};
use crate::models::payload::ParsePayload;
use crate::models::task::TaskType;
use crate::services::model_client::ModelRequest;
use crate::services::storage::DocumentSource;
use crate::services::task_error::TaskError;

const SYSTEM_PROMPT: &str = "You extract structured data from business documents. \
Reply with a single JSON object and nothing else. Use null for values that are not present.";

/// Extracts structured fields from a document.
pub struct ParseHandler {
    documents: Arc<dyn DocumentSource>,
    limits: DocumentLimits,
}

impl ParseHandler {
    pub fn new(documents: Arc<dyn DocumentSource>, limits: DocumentLimits) -> Self {
        Self { documents, limits }
    }
}

fn prompt(fields: &[String]) -> String {
    if fields.is_empty() {
        "Extract the document's title, type, parties, dates, monetary amounts and any other \
         key fields as a JSON object."
            .to_string()
    } else {
        format!(
            "Extract exactly these fields as a JSON object with the same keys: {}.",
            fields.join(", ")
        )
    }
}

#[async_trait]
impl TaskHandler for ParseHandler {
    fn task_type(&self) -> TaskType {
        TaskType::Parse
    }

    async fn handle(
        &self,
        ctx: &TaskContext,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, TaskError> {
        let payload: ParsePayload = decode_payload(payload)?;

        ctx.progress(20, "Loading document").await?;
        let document =
            load_document(self.documents.as_ref(), &payload.file_ref, self.limits, ctx.scope())
                .await?;

        ctx.progress(40, "Extracting fields").await?;
        let completion = ctx
            .call_model(ModelRequest {
                system: SYSTEM_PROMPT.to_string(),
                prompt: prompt(&payload.fields),
                document: Some(document_input(&document)),
                max_tokens: None,
            })
            .await?;

        ctx.progress(70, "Validating fields").await?;
        let mut fields = extract_json(&completion.text)?;
        if !payload.fields.is_empty() {
            if let Some(map) = fields.as_object_mut() {
                map.retain(|key, _| payload.fields.contains(key));
                for wanted in &payload.fields {
                    map.entry(wanted.clone()).or_insert(serde_json::Value::Null);
                }
            }
        }

        ctx.progress(90, "Assembling result").await?;
        let missing = fields
            .as_object()
            .map(|map| map.values().filter(|v| v.is_null()).count())
            .unwrap_or(0);
        let result = json!({
            "file_ref": payload.file_ref,
            "fields": fields,
            "missing_fields": missing,
        });

        ctx.progress(100, "Done").await?;
        Ok(result)
    }
}
