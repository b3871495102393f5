use crate::config::S3Config;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Errors returned by object storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Download failed for {key}: {message}")]
    DownloadFailed { key: String, message: String },

    #[error("Upload failed for {key}: {message}")]
    UploadFailed { key: String, message: String },

    #[error("Delete failed for {key}: {message}")]
    DeleteFailed { key: String, message: String },

    #[error("Presign failed for {key}: {message}")]
    PresignFailed { key: String, message: String },
}

/// Durable key/value blob store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Fetch an object, failing with [`StorageError::NotFound`] if it is absent.
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Store an object, replacing any previous version.
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), StorageError>;

    /// Delete an object. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Time-limited download URL for an object.
    async fn presigned_url(&self, key: &str, expires_in: Duration) -> Result<String, StorageError>;
}

/// S3-backed object storage for source videos and frame archives
pub struct S3Storage {
    client: S3Client,
    bucket: String,
    multipart_threshold_bytes: usize,
    part_size_bytes: usize,
}

impl S3Storage {
    /// Create a new S3 storage client
    pub async fn new(config: &S3Config) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 storage initialized"
        );

        Self {
            client,
            bucket: config.bucket.clone(),
            multipart_threshold_bytes: config.multipart_threshold_bytes,
            part_size_bytes: config.part_size_bytes,
        }
    }

    /// Single-part upload for small objects
    async fn simple_upload(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| upload_failed(key, e))?;

        Ok(())
    }

    /// Multipart upload for large objects
    async fn multipart_upload(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| upload_failed(key, e))?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| upload_failed(key, "No upload ID in response"))?
            .to_string();

        match self.upload_parts(key, &upload_id, &body).await {
            Ok(completed_parts) => {
                let completed_upload = CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build();

                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(completed_upload)
                    .send()
                    .await
                    .map_err(|e| upload_failed(key, e))?;

                Ok(())
            }
            Err(e) => {
                // Abandoned uploads keep their parts billed until aborted
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(key = %key, error = %abort_err, "Failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        body: &[u8],
    ) -> Result<Vec<CompletedPart>, StorageError> {
        let mut completed_parts = Vec::new();

        for (index, chunk) in body.chunks(self.part_size_bytes).enumerate() {
            let part_number = index as i32 + 1;

            let upload_part_response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk.to_vec()))
                .send()
                .await
                .map_err(|e| upload_failed(key, e))?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );
        }

        Ok(completed_parts)
    }
}

#[async_trait]
impl ObjectStorage for S3Storage {
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    StorageError::NotFound(key.to_string())
                } else {
                    StorageError::DownloadFailed {
                        key: key.to_string(),
                        message: e.to_string(),
                    }
                }
            })?;

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::DownloadFailed {
                key: key.to_string(),
                message: e.to_string(),
            })?
            .into_bytes();

        debug!(key = %key, size_bytes = body.len(), "Object downloaded");
        Ok(body.to_vec())
    }

    #[instrument(skip(self, body), fields(bucket = %self.bucket, size_bytes = body.len()))]
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), StorageError> {
        let size_bytes = body.len();

        if size_bytes > self.multipart_threshold_bytes {
            self.multipart_upload(key, body, content_type).await?;
        } else {
            self.simple_upload(key, body, content_type).await?;
        }

        info!(key = %key, size_bytes = size_bytes, "Object uploaded");
        Ok(())
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::DeleteFailed {
                key: key.to_string(),
                message: e.to_string(),
            })?;

        debug!(key = %key, "Object deleted");
        Ok(())
    }

    async fn presigned_url(&self, key: &str, expires_in: Duration) -> Result<String, StorageError> {
        let presign_failed = |message: String| StorageError::PresignFailed {
            key: key.to_string(),
            message,
        };

        let presigning_config =
            PresigningConfig::expires_in(expires_in).map_err(|e| presign_failed(e.to_string()))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| presign_failed(e.to_string()))?;

        Ok(presigned.uri().to_string())
    }
}

fn upload_failed(key: &str, error: impl ToString) -> StorageError {
    StorageError::UploadFailed {
        key: key.to_string(),
        message: error.to_string(),
    }
}

/// Sanitize a key component to prevent path traversal
pub fn sanitize_key_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

/// Join a prefix and a file name into a storage key
pub fn object_key(prefix: &str, file_name: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        file_name.to_string()
    } else {
        format!("{}/{}", prefix, file_name)
    }
}

/// Get content type for a video file extension
pub fn video_content_type(extension: &str) -> &'static str {
    match extension.to_lowercase().as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        _ => "application/octet-stream",
    }
}
