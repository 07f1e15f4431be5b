use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::{
    decode_payload, document_input, extract_json, load_document, DocumentLimits, TaskContext,
    TaskHandler,
};
use crate::models::payload::ReviewPayload;
use crate::models::task::TaskType;
use crate::services::model_client::ModelRequest;
use crate::services::storage::DocumentSource;
use crate::services::task_error::TaskError;

const SYSTEM_PROMPT: &str = "You review business documents for errors, inconsistencies and risks. \
Reply with a JSON object {\"issues\": [{\"severity\": \"low\"|\"medium\"|\"high\", \
\"location\": string, \"description\": string}], \"summary\": string} and nothing else.";

/// Lists issues found in a document.
pub struct ReviewHandler {
    documents: Arc<dyn DocumentSource>,
    limits: DocumentLimits,
}

impl ReviewHandler {
    pub fn new(documents: Arc<dyn DocumentSource>, limits: DocumentLimits) -> Self {
        Self { documents, limits }
    }
}

#[async_trait]
impl TaskHandler for ReviewHandler {
    fn task_type(&self) -> TaskType {
        TaskType::Review
    }

    async fn handle(
        &self,
        ctx: &TaskContext,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, TaskError> {
        let payload: ReviewPayload = decode_payload(payload)?;

        ctx.progress(20, "Loading document").await?;
        let document =
            load_document(self.documents.as_ref(), &payload.file_ref, self.limits, ctx.scope())
                .await?;

        ctx.progress(40, "Reviewing document").await?;
        let prompt = match &payload.instructions {
            Some(focus) => format!("Review the attached document. Focus on: {focus}"),
            None => "Review the attached document.".to_string(),
        };
        let completion = ctx
            .call_model(ModelRequest {
                system: SYSTEM_PROMPT.to_string(),
                prompt,
                document: Some(document_input(&document)),
                max_tokens: None,
            })
            .await?;

        ctx.progress(70, "Classifying issues").await?;
        let review = extract_json(&completion.text)?;
        let issues = review
            .get("issues")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let high = issues
            .iter()
            .filter(|issue| issue.get("severity").and_then(|s| s.as_str()) == Some("high"))
            .count();

        ctx.progress(90, "Assembling result").await?;
        let result = json!({
            "file_ref": payload.file_ref,
            "summary": review.get("summary").cloned().unwrap_or(serde_json::Value::Null),
            "issue_count": issues.len(),
            "high_severity": high,
            "issues": issues,
        });

        ctx.progress(100, "Done").await?;
        Ok(result)
    }
}
