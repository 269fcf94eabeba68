//! Queue contract consumed by the worker.
//!
//! Any at-least-once queue with long-poll receive, per-message
//! visibility timeouts and receipt-handle acknowledgement can back the
//! worker by implementing [`JobQueue`].

use async_trait::async_trait;

/// One received, not yet acknowledged, queue message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Queue-assigned message id (stable across redeliveries).
    pub message_id: String,
    /// Acknowledgement token for this particular delivery.
    pub receipt_handle: String,
    /// Raw message body.
    pub body: String,
    /// How many times the queue has handed this message out, including
    /// this delivery. `1` on first delivery.
    pub receive_count: u32,
}

/// Errors from the queue layer, split by whether retrying can help.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// Network failure, throttling, server-side error. Retry with backoff.
    #[error("Transient queue error: {0}")]
    Transient(String),

    /// Misconfiguration: unknown queue, bad URL, denied credentials.
    #[error("Permanent queue error: {0}")]
    Permanent(String),
}

impl QueueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Long-poll queue operations needed by the worker.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Receive up to `max_messages`, waiting server-side for up to
    /// `wait_secs` when the queue is empty.
    ///
    /// Received messages stay hidden for `visibility_timeout_secs`, or for
    /// the queue's own default when `None`.
    async fn receive(
        &self,
        max_messages: u32,
        wait_secs: u32,
        visibility_timeout_secs: Option<u32>,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    /// Hide the message from other consumers for another `secs` seconds,
    /// counted from now.
    async fn extend_visibility(&self, receipt_handle: &str, secs: u32) -> Result<(), QueueError>;

    /// Acknowledge (permanently remove) the message.
    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError>;
}
