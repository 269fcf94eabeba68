//! Object storage for finished artifacts.

use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;

/// Errors from the object storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Upload to {locator} failed: {message}")]
    Upload { locator: String, message: String },
}

/// Destination for generated artifacts.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `bytes` under `key`. Returns the canonical locator of the
    /// stored object (e.g. `s3://bucket/key`).
    async fn upload(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StorageError>;
}

/// Uploads artifacts into a single S3 bucket.
#[derive(Clone)]
pub struct S3ArtifactStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ArtifactStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    pub fn from_config(config: &aws_config::SdkConfig, bucket: impl Into<String>) -> Self {
        Self::new(aws_sdk_s3::Client::new(config), bucket)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl ArtifactStore for S3ArtifactStore {
    async fn upload(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StorageError> {
        let locator = s3_url(&self.bucket, key);
        let size = bytes.len();

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| StorageError::Upload {
                locator: locator.clone(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        tracing::info!(locator = %locator, size, "Artifact uploaded");
        Ok(locator)
    }
}

/// Canonical `s3://bucket/key` locator.
pub fn s3_url(bucket: &str, key: &str) -> String {
    format!("s3://{bucket}/{}", key.trim_start_matches('/'))
}

/// Guess a content type from a file name's extension.
pub fn content_type_for(filename: &str) -> &'static str {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s3_url_joins_bucket_and_key() {
        assert_eq!(s3_url("bucket", "path/to/image.png"), "s3://bucket/path/to/image.png");
    }

    #[test]
    fn s3_url_strips_leading_slash() {
        assert_eq!(s3_url("bucket", "/image.png"), "s3://bucket/image.png");
    }

    #[test]
    fn content_type_from_extension() {
        assert_eq!(content_type_for("out.PNG"), "image/png");
        assert_eq!(content_type_for("a.b.jpeg"), "image/jpeg");
        assert_eq!(content_type_for("clip.mp4"), "video/mp4");
        assert_eq!(content_type_for("noext"), "application/octet-stream");
    }
}
