//! In-process [`JobQueue`] with SQS-like visibility semantics.
//!
//! Messages handed out by [`MemoryQueue::receive`] stay hidden for the
//! visibility timeout and reappear afterwards unless deleted or
//! extended. Every delivery gets a fresh receipt handle and invalidates
//! the previous one, matching SQS. Scripted receive errors can be queued
//! up with [`MemoryQueue::push_receive_error`] to exercise failure paths.
//!
//! Timing uses [`tokio::time`], so paused-clock tests advance it freely.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::queue::{JobQueue, QueueError, QueueMessage};

/// Visibility timeout for receives that do not request one.
const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// How often an empty long-poll re-checks for visible messages.
const LONG_POLL_TICK: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct Entry {
    message_id: String,
    body: String,
    receipt_handle: Option<String>,
    visible_at: Instant,
    receive_count: u32,
}

#[derive(Debug, Default)]
struct Inner {
    entries: Vec<Entry>,
    receive_errors: VecDeque<QueueError>,
    deleted: Vec<String>,
    receive_calls: u64,
    extensions: u64,
    next_id: u64,
}

/// In-memory queue. Cheap to share behind an `Arc`.
#[derive(Debug)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    visibility_timeout: Duration,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::with_visibility_timeout(DEFAULT_VISIBILITY_TIMEOUT)
    }

    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            visibility_timeout,
        }
    }

    /// Enqueue a message body. Returns its message id.
    pub fn send(&self, body: impl Into<String>) -> String {
        let mut inner = self.lock();
        inner.next_id += 1;
        let message_id = format!("msg-{}", inner.next_id);
        inner.entries.push(Entry {
            message_id: message_id.clone(),
            body: body.into(),
            receipt_handle: None,
            visible_at: Instant::now(),
            receive_count: 0,
        });
        message_id
    }

    /// Make the next `receive` call fail with `error`. Errors are
    /// consumed in FIFO order, one per call.
    pub fn push_receive_error(&self, error: QueueError) {
        self.lock().receive_errors.push_back(error);
    }

    /// Message ids that have been acknowledged, in deletion order.
    pub fn deleted(&self) -> Vec<String> {
        self.lock().deleted.clone()
    }

    /// Messages still in the queue (visible or in flight).
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of `receive` calls, including failed ones.
    pub fn receive_calls(&self) -> u64 {
        self.lock().receive_calls
    }

    /// Total number of successful visibility extensions.
    pub fn extensions(&self) -> u64 {
        self.lock().extensions
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hand out up to `max` visible messages, hiding them for `visibility`.
    fn take_visible(&self, max: usize, visibility: Duration) -> Vec<QueueMessage> {
        let now = Instant::now();
        let mut inner = self.lock();
        let mut out = Vec::new();

        for entry in inner.entries.iter_mut() {
            if out.len() >= max {
                break;
            }
            if entry.visible_at > now {
                continue;
            }
            entry.receive_count += 1;
            let receipt = format!("{}-r{}", entry.message_id, entry.receive_count);
            entry.receipt_handle = Some(receipt.clone());
            entry.visible_at = now + visibility;
            out.push(QueueMessage {
                message_id: entry.message_id.clone(),
                receipt_handle: receipt,
                body: entry.body.clone(),
                receive_count: entry.receive_count,
            });
        }

        out
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn receive(
        &self,
        max_messages: u32,
        wait_secs: u32,
        visibility_timeout_secs: Option<u32>,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        {
            let mut inner = self.lock();
            inner.receive_calls += 1;
            if let Some(error) = inner.receive_errors.pop_front() {
                return Err(error);
            }
        }

        let visibility = visibility_timeout_secs
            .map_or(self.visibility_timeout, |secs| Duration::from_secs(u64::from(secs)));
        let deadline = Instant::now() + Duration::from_secs(u64::from(wait_secs));
        loop {
            let messages = self.take_visible(max_messages.max(1) as usize, visibility);
            if !messages.is_empty() || Instant::now() >= deadline {
                return Ok(messages);
            }
            tokio::time::sleep(LONG_POLL_TICK).await;
        }
    }

    async fn extend_visibility(&self, receipt_handle: &str, secs: u32) -> Result<(), QueueError> {
        let mut inner = self.lock();
        let entry = inner
            .entries
            .iter_mut()
            .find(|e| e.receipt_handle.as_deref() == Some(receipt_handle))
            .ok_or_else(|| {
                QueueError::Transient(format!("receipt handle {receipt_handle} is no longer valid"))
            })?;
        entry.visible_at = Instant::now() + Duration::from_secs(u64::from(secs));
        inner.extensions += 1;
        Ok(())
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        let mut inner = self.lock();
        let index = inner
            .entries
            .iter()
            .position(|e| e.receipt_handle.as_deref() == Some(receipt_handle))
            .ok_or_else(|| {
                QueueError::Transient(format!("receipt handle {receipt_handle} is no longer valid"))
            })?;
        let entry = inner.entries.remove(index);
        inner.deleted.push(entry.message_id);
        Ok(())
    }
}
