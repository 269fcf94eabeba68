//! Amazon SQS implementation of [`JobQueue`].
//!
//! SDK failures are sorted into transient (retry with backoff) and
//! permanent (misconfiguration) so the poller can tell a throttled
//! queue apart from a queue that does not exist.

use async_trait::async_trait;
use aws_sdk_sqs::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_sqs::types::MessageSystemAttributeName;

use crate::queue::{JobQueue, QueueError, QueueMessage};

/// Error codes that indicate misconfiguration rather than a temporary
/// outage. Retrying these only burns requests.
const PERMANENT_ERROR_CODES: &[&str] = &[
    "AWS.SimpleQueueService.NonExistentQueue",
    "QueueDoesNotExist",
    "AccessDenied",
    "AccessDeniedException",
    "InvalidClientTokenId",
    "UnrecognizedClientException",
    "SignatureDoesNotMatch",
    "InvalidSecurity",
    "InvalidAddress",
    "MissingParameter",
    "InvalidParameterValue",
    "KmsAccessDenied",
    "KmsDisabled",
    "KmsNotFound",
];

/// SQS client bound to a single queue URL.
#[derive(Clone)]
pub struct SqsJobQueue {
    client: aws_sdk_sqs::Client,
    queue_url: String,
}

impl SqsJobQueue {
    pub fn new(client: aws_sdk_sqs::Client, queue_url: impl Into<String>) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
        }
    }

    /// Build a client from shared AWS configuration.
    pub fn from_config(config: &aws_config::SdkConfig, queue_url: impl Into<String>) -> Self {
        Self::new(aws_sdk_sqs::Client::new(config), queue_url)
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }
}

#[async_trait]
impl JobQueue for SqsJobQueue {
    async fn receive(
        &self,
        max_messages: u32,
        wait_secs: u32,
        visibility_timeout_secs: Option<u32>,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages as i32)
            .wait_time_seconds(wait_secs as i32)
            .set_visibility_timeout(visibility_timeout_secs.map(|secs| secs as i32))
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .send()
            .await
            .map_err(|e| classify("ReceiveMessage", e))?;

        let mut messages = Vec::with_capacity(output.messages().len());
        for message in output.messages() {
            let Some(receipt_handle) = message.receipt_handle() else {
                tracing::warn!(
                    message_id = ?message.message_id(),
                    "SQS message without receipt handle, skipping",
                );
                continue;
            };

            let receive_count = message
                .attributes()
                .and_then(|attrs| attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount))
                .and_then(|value| value.parse().ok())
                .unwrap_or(1);

            messages.push(QueueMessage {
                message_id: message.message_id().unwrap_or_default().to_string(),
                receipt_handle: receipt_handle.to_string(),
                body: message.body().unwrap_or_default().to_string(),
                receive_count,
            });
        }

        Ok(messages)
    }

    async fn extend_visibility(&self, receipt_handle: &str, secs: u32) -> Result<(), QueueError> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(secs as i32)
            .send()
            .await
            .map_err(|e| classify("ChangeMessageVisibility", e))?;
        Ok(())
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| classify("DeleteMessage", e))?;
        Ok(())
    }
}

/// Map an SDK error onto the transient/permanent split.
///
/// Request construction failures (bad URL, missing region) and the
/// service codes in [`PERMANENT_ERROR_CODES`] are permanent. Everything
/// else, including timeouts, dispatch failures and throttling, is
/// transient.
pub(crate) fn classify<E, R>(operation: &'static str, err: SdkError<E, R>) -> QueueError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = format!("{operation}: {}", DisplayErrorContext(&err));
    match &err {
        SdkError::ConstructionFailure(_) => QueueError::Permanent(message),
        SdkError::ServiceError(_) if is_permanent_code(err.code()) => {
            QueueError::Permanent(message)
        }
        _ => QueueError::Transient(message),
    }
}

/// Whether an SQS error code means the queue is misconfigured.
pub fn is_permanent_code(code: Option<&str>) -> bool {
    code.is_some_and(|code| PERMANENT_ERROR_CODES.contains(&code))
}
