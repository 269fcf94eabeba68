//! Job completion events.
//!
//! Once a job's artifact is stored, downstream consumers are told via a
//! separate completion queue. The event body is
//! `{"jobId": "...", "imageUrl": "..."}` where `imageUrl` is the public
//! HTTPS form of the stored object when the locator is a well-formed
//! `s3://` URL, and the locator unchanged otherwise.

use async_trait::async_trait;
use aws_sdk_sqs::error::DisplayErrorContext;
use serde::Serialize;

/// Errors from publishing a completion event.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Failed to encode completion event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Failed to publish completion event for job {job_id}: {message}")]
    Send { job_id: String, message: String },
}

/// Wire form of a completion event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletionEvent {
    #[serde(rename = "jobId")]
    pub job_id: String,
    #[serde(rename = "imageUrl")]
    pub image_url: String,
}

impl CompletionEvent {
    /// Build the event for `job_id`, resolving `locator` to a public URL.
    pub fn new(job_id: &str, locator: &str, region: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            image_url: public_url(locator, region).unwrap_or_else(|| locator.to_string()),
        }
    }
}

/// Announces finished jobs to downstream systems.
#[async_trait]
pub trait CompletionPublisher: Send + Sync {
    async fn publish(&self, job_id: &str, locator: &str) -> Result<(), PublishError>;
}

/// Publishes completion events to an SQS queue.
#[derive(Clone)]
pub struct SqsCompletionPublisher {
    client: aws_sdk_sqs::Client,
    queue_url: String,
    region: String,
}

impl SqsCompletionPublisher {
    pub fn new(
        client: aws_sdk_sqs::Client,
        queue_url: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
            region: region.into(),
        }
    }

    pub fn from_config(
        config: &aws_config::SdkConfig,
        queue_url: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self::new(aws_sdk_sqs::Client::new(config), queue_url, region)
    }
}

#[async_trait]
impl CompletionPublisher for SqsCompletionPublisher {
    async fn publish(&self, job_id: &str, locator: &str) -> Result<(), PublishError> {
        let event = CompletionEvent::new(job_id, locator, &self.region);
        let body = serde_json::to_string(&event)?;

        self.client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .send()
            .await
            .map_err(|e| PublishError::Send {
                job_id: job_id.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        tracing::info!(job_id, image_url = %event.image_url, "Completion event published");
        Ok(())
    }
}

/// Convert `s3://bucket/key` into
/// `https://bucket.s3.<region>.amazonaws.com/key`.
///
/// Returns `None` when the locator is not a well-formed S3 URL.
pub fn public_url(locator: &str, region: &str) -> Option<String> {
    let rest = locator.strip_prefix("s3://")?;
    let (bucket, key) = rest.split_once('/')?;
    if bucket.is_empty() || key.is_empty() {
        return None;
    }
    Some(format!("https://{bucket}.s3.{region}.amazonaws.com/{key}"))
}
