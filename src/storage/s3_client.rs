//! S3-compatible storage client
//!
//! Wraps the AWS SDK for S3-compatible storage access.

use std::path::Path;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{http::HttpResponse, Credentials, Region},
    error::SdkError,
    operation::put_object::PutObjectError,
    primitives::ByteStream,
    Client,
};

use crate::config::StorageConfig;

use super::types::{RemoteStore, TransferError};

/// S3-compatible storage client
#[derive(Clone)]
pub struct S3Client {
    client: Client,
    bucket: String,
}

impl S3Client {
    /// Create a new S3 client from configuration
    pub async fn new(config: &StorageConfig) -> Self {
        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "video-ingest",
        );

        let region = config
            .region
            .clone()
            .unwrap_or_else(|| "us-east-1".to_string());

        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&config.endpoint)
            .region(Region::new(region))
            .credentials_provider(credentials)
            .force_path_style(true) // Required for MinIO and other S3-compatible services
            .build();

        let client = Client::from_conf(s3_config);

        // Check the bucket up front, but keep going: uploads retry on their own
        let bucket = config.bucket.clone();
        match client.head_bucket().bucket(&bucket).send().await {
            Ok(_) => {
                tracing::info!("Connected to S3 bucket: {}", bucket);
            }
            Err(e) => {
                tracing::warn!(
                    "Could not verify bucket {}: {}. Will attempt operations anyway.",
                    bucket,
                    e
                );
            }
        }

        Self { client, bucket }
    }
}

/// Sort SDK failures into retryable and permanent
fn classify(err: SdkError<PutObjectError, HttpResponse>) -> TransferError {
    let status = err.raw_response().map(|r| r.status().as_u16());
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            TransferError::Transient(format!("{:?}", err))
        }
        SdkError::ServiceError(service) => {
            let message = format!("S3 returned {:?}: {}", status, service.err());
            match status {
                Some(code) if code >= 500 || code == 429 => TransferError::Transient(message),
                _ => TransferError::Rejected(message),
            }
        }
        other => TransferError::Rejected(format!("{:?}", other)),
    }
}

#[async_trait]
impl RemoteStore for S3Client {
    async fn put_file(&self, key: &str, path: &Path, content_type: &str) -> Result<(), TransferError> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| TransferError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(body)
            .send()
            .await
            .map_err(classify)?;

        tracing::debug!(bucket = %self.bucket, key = %key, "Stored object");
        Ok(())
    }
}
