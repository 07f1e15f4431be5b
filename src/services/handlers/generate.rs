use async_trait::async_trait;
use serde_json::json;

use super::{decode_payload, TaskContext, TaskHandler};
use crate::models::payload::GeneratePayload;
use crate::models::task::TaskType;
use crate::services::model_client::ModelRequest;
use crate::services::task_error::TaskError;

const SYSTEM_PROMPT: &str = "You draft business documents from a template identifier and \
instructions. Reply with the finished document in Markdown only.";

/// Drafts a new document. Needs no input document.
pub struct GenerateHandler;

#[async_trait]
impl TaskHandler for GenerateHandler {
    fn task_type(&self) -> TaskType {
        TaskType::Generate
    }

    async fn handle(
        &self,
        ctx: &TaskContext,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, TaskError> {
        let payload: GeneratePayload = decode_payload(payload)?;

        ctx.progress(20, "Preparing template").await?;
        let mut prompt = format!("Template: {}", payload.template_id);
        if let Some(customer) = &payload.customer_id {
            prompt.push_str(&format!("\nCustomer: {customer}"));
        }
        if let Some(instructions) = &payload.instructions {
            prompt.push_str(&format!("\nInstructions:\n{instructions}"));
        }

        ctx.progress(40, "Drafting document").await?;
        let completion = ctx
            .call_model(ModelRequest {
                system: SYSTEM_PROMPT.to_string(),
                prompt,
                document: None,
                max_tokens: None,
            })
            .await?;

        ctx.progress(70, "Checking draft").await?;
        let content = completion.text.trim().to_string();
        if content.is_empty() {
            return Err(TaskError::Internal("model returned an empty draft".to_string()));
        }

        ctx.progress(90, "Assembling result").await?;
        let result = json!({
            "template_id": payload.template_id,
            "customer_id": payload.customer_id,
            "content": content,
            "format": "markdown",
        });

        ctx.progress(100, "Done").await?;
        Ok(result)
    }
}
