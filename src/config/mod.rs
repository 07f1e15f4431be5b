use serde::Deserialize;
use std::time::Duration;

use crate::services::consumer::WorkerSettings;
use crate::services::handlers::DocumentLimits;
use crate::services::retry::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Unused by the worker.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for task streams and pub/sub
    pub redis_url: String,

    /// Model provider name, used for price lookup
    #[serde(default = "default_ai_provider")]
    pub ai_provider: String,

    /// Model API key (worker only)
    pub ai_api_key: Option<String>,

    #[serde(default = "default_ai_base_url")]
    pub ai_base_url: String,

    #[serde(default = "default_ai_model")]
    pub ai_model: String,

    /// Process-wide cap on concurrent model calls
    #[serde(default = "default_max_concurrent_api_calls")]
    pub max_concurrent_api_calls: usize,

    /// Total attempts per model call, including the first
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_task_cost_ceiling_usd")]
    pub task_cost_ceiling_usd: f64,

    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,

    /// Stable consumer name. Generated per process when unset.
    pub consumer_name: Option<String>,

    #[serde(default = "default_claim_count")]
    pub claim_count: usize,

    #[serde(default = "default_claim_block_ms")]
    pub claim_block_ms: u64,

    #[serde(default = "default_visibility_timeout_ms")]
    pub visibility_timeout_ms: u64,

    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u64,

    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    #[serde(default = "default_max_document_bytes")]
    pub max_document_bytes: usize,

    /// R2 bucket name
    pub r2_bucket: Option<String>,

    /// R2 endpoint URL
    pub r2_endpoint: Option<String>,

    /// R2 access key ID (S3-compatible)
    pub r2_access_key: Option<String>,

    /// R2 secret access key (S3-compatible)
    pub r2_secret_key: Option<String>,

    /// Address for the worker's Prometheus listener
    pub metrics_addr: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_ai_provider() -> String {
    "anthropic".to_string()
}

fn default_ai_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_ai_model() -> String {
    "claude-3-5-sonnet-latest".to_string()
}

fn default_max_concurrent_api_calls() -> usize {
    2
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    1000
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_task_cost_ceiling_usd() -> f64 {
    1.0
}

fn default_task_timeout_secs() -> u64 {
    900
}

fn default_claim_count() -> usize {
    1
}

fn default_claim_block_ms() -> u64 {
    5000
}

fn default_visibility_timeout_ms() -> u64 {
    300_000
}

fn default_max_deliveries() -> u64 {
    5
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_max_document_bytes() -> usize {
    20 * 1024 * 1024
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required setting {0}")]
    Missing(&'static str),
}

/// R2 connection settings.
#[derive(Debug, Clone)]
pub struct R2Settings {
    pub bucket: String,
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        let mut settings = WorkerSettings {
            claim_count: self.claim_count.max(1),
            claim_block: Duration::from_millis(self.claim_block_ms),
            visibility_timeout: Duration::from_millis(self.visibility_timeout_ms),
            max_deliveries: self.max_deliveries,
            concurrency: self.worker_concurrency.max(1),
            task_timeout: Duration::from_secs(self.task_timeout_secs),
            cost_ceiling: self.task_cost_ceiling_usd,
            ..WorkerSettings::default()
        };
        if let Some(name) = &self.consumer_name {
            settings.consumer_name = name.clone();
        }
        settings
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries.max(1),
            base_delay: Duration::from_millis(self.retry_base_ms),
            ..RetryPolicy::default()
        }
    }

    pub fn document_limits(&self) -> DocumentLimits {
        DocumentLimits {
            max_bytes: self.max_document_bytes,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn ai_api_key(&self) -> Result<&str, ConfigError> {
        self.ai_api_key
            .as_deref()
            .ok_or(ConfigError::Missing("AI_API_KEY"))
    }

    pub fn r2_settings(&self) -> Result<R2Settings, ConfigError> {
        let required = |value: &Option<String>, name: &'static str| {
            value.clone().ok_or(ConfigError::Missing(name))
        };
        Ok(R2Settings {
            bucket: required(&self.r2_bucket, "R2_BUCKET")?,
            endpoint: required(&self.r2_endpoint, "R2_ENDPOINT")?,
            access_key: required(&self.r2_access_key, "R2_ACCESS_KEY")?,
            secret_key: required(&self.r2_secret_key, "R2_SECRET_KEY")?,
        })
    }
}
