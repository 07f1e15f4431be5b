use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};

/// A document referenced by a task payload.
#[derive(Debug, Clone)]
pub struct Document {
    pub file_ref: String,
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Where task documents are read from.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn fetch(&self, file_ref: &str) -> Result<Document, StorageError>;
}

/// Client for Cloudflare R2 object storage (S3-compatible).
pub struct R2Client {
    bucket: Box<Bucket>,
}

impl R2Client {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self { bucket })
    }

    /// Store a document under `key`. Producers write here before submitting.
    pub async fn upload(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        self.bucket
            .put_object_with_content_type(key, data, content_type)
            .await
            .map_err(StorageError::S3)?;
        Ok(())
    }
}

#[async_trait]
impl DocumentSource for R2Client {
    async fn fetch(&self, file_ref: &str) -> Result<Document, StorageError> {
        let response = self.bucket.get_object(file_ref).await.map_err(StorageError::S3)?;
        match response.status_code() {
            200 => {}
            404 => return Err(StorageError::NotFound(file_ref.to_string())),
            code => {
                return Err(StorageError::Config(format!(
                    "unexpected status {code} fetching {file_ref}"
                )))
            }
        }

        let content_type = response
            .headers()
            .get("content-type")
            .map(|value| value.to_string());

        Ok(Document {
            file_ref: file_ref.to_string(),
            bytes: response.to_vec(),
            content_type,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Storage configuration error: {0}")]
    Config(String),
}
