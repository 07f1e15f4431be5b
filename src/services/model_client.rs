use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// One call to the external model.
#[derive(Debug, Clone, Default)]
pub struct ModelRequest {
    pub system: String,
    pub prompt: String,
    pub document: Option<DocumentInput>,
    /// Output cap. Filled from the provider's price entry when unset.
    pub max_tokens: Option<u32>,
}

/// Document content attached to a request.
#[derive(Debug, Clone)]
pub enum DocumentInput {
    Text(String),
    Binary { media_type: String, bytes: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelResponse {
    pub text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// Raw, single-attempt access to a model provider.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Provider name used for price lookup.
    fn provider(&self) -> &str;

    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, ApiError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    Network,
    Timeout,
    RateLimited,
    ServerError,
    Unauthorized,
    BadRequest,
    QuotaExceeded,
    Parse,
}

/// Whether a failed call may be attempted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retryable,
    Fatal,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?} (HTTP {status:?}): {message}")]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub status: Option<u16>,
    pub message: String,
    /// Provider-suggested wait from a `retry-after` header.
    pub retry_after: Option<Duration>,
}

impl ApiError {
    pub fn new(kind: ApiErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn from_status(status: u16, message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            kind: classify_http_status(status),
            status: Some(status),
            message: message.into(),
            retry_after,
        }
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ApiErrorKind::Timeout
        } else if err.is_decode() {
            ApiErrorKind::Parse
        } else {
            ApiErrorKind::Network
        };
        Self::new(kind, err.to_string())
    }
}

/// Classify a failure as retryable or fatal.
pub fn classify(err: &ApiError) -> Disposition {
    match err.kind {
        ApiErrorKind::Network
        | ApiErrorKind::Timeout
        | ApiErrorKind::RateLimited
        | ApiErrorKind::ServerError => Disposition::Retryable,
        ApiErrorKind::Unauthorized
        | ApiErrorKind::BadRequest
        | ApiErrorKind::QuotaExceeded
        | ApiErrorKind::Parse => Disposition::Fatal,
    }
}

pub fn classify_http_status(status: u16) -> ApiErrorKind {
    match status {
        401 | 403 => ApiErrorKind::Unauthorized,
        402 => ApiErrorKind::QuotaExceeded,
        408 => ApiErrorKind::Timeout,
        429 => ApiErrorKind::RateLimited,
        400..=499 => ApiErrorKind::BadRequest,
        // 5xx and the provider's 529 "overloaded".
        _ => ApiErrorKind::ServerError,
    }
}

/// HTTP client for an Anthropic-messages-shaped model API.
pub struct HttpModelClient {
    http: Client,
    provider: String,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<Message>,
}

#[derive(Serialize)]
struct Message {
    role: &'static str,
    content: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    usage: Usage,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    input_tokens: u64,
    output_tokens: u64,
}

impl HttpModelClient {
    pub fn new(
        provider: String,
        base_url: String,
        api_key: String,
        model: String,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            provider,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
        })
    }

    fn content_blocks(request: &ModelRequest) -> Vec<serde_json::Value> {
        let mut blocks = Vec::with_capacity(2);
        match &request.document {
            Some(DocumentInput::Text(text)) => blocks.push(serde_json::json!({
                "type": "text",
                "text": format!("<document>\n{text}\n</document>"),
            })),
            Some(DocumentInput::Binary { media_type, bytes }) => blocks.push(serde_json::json!({
                "type": "document",
                "source": {
                    "type": "base64",
                    "media_type": media_type,
                    "data": base64::engine::general_purpose::STANDARD.encode(bytes),
                },
            })),
            None => {}
        }
        blocks.push(serde_json::json!({ "type": "text", "text": request.prompt }));
        blocks
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, ApiError> {
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: request.max_tokens.unwrap_or(4096),
            system: &request.system,
            messages: vec![Message {
                role: "user",
                content: Self::content_blocks(request),
            }],
        };

        let response = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(ApiError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);
            let text = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status.as_u16(), text, retry_after));
        }

        let parsed: MessagesResponse = response.json().await.map_err(ApiError::from_reqwest)?;
        let text = parsed
            .content
            .into_iter()
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");

        Ok(ModelResponse {
            text,
            tokens_in: parsed.usage.input_tokens,
            tokens_out: parsed.usage.output_tokens,
        })
    }
}
