//! Per-message job dispatch.
//!
//! [`Dispatcher::dispatch`] takes one received message through parsing,
//! attempt accounting, engine execution and acknowledgement. While the
//! engine runs, a heartbeat task keeps the message hidden from other
//! consumers. Its first extension goes out as soon as the dispatch
//! starts, so the queue's own visibility default never decides who else
//! sees the message. The task is bound to a drop guard and stops however
//! the dispatch ends, including when the surrounding task is aborted.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};

use imagex_cloud::queue::{JobQueue, QueueMessage};
use imagex_comfyui::engine::{EngineError, GenerationEngine};
use imagex_core::retry::DEFAULT_MAX_ATTEMPTS;
use imagex_core::status::{JobCounter, StatusRegistry};
use imagex_core::types::JobId;

use crate::completion::CompletionSink;
use crate::message::JobMessage;

/// Local attempt records for jobs not seen again within this window are
/// forgotten; the queue's receive count still bounds their attempts.
const ATTEMPT_RECORD_TTL: Duration = Duration::from_secs(24 * 60 * 60);

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Result of dispatching one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Engine finished and the message was acknowledged.
    Success,
    /// Left on the queue; it becomes visible again when its visibility
    /// timeout lapses.
    RetryableFailure,
    /// Removed from the queue without success (malformed, rejected by the
    /// engine, or out of attempts).
    PermanentFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    /// Seconds each heartbeat pushes the visibility deadline out by.
    pub visibility_timeout_secs: u32,
    pub heartbeat_interval: Duration,
    /// Hard ceiling on one engine run, counted as a transient failure.
    pub max_processing_time: Duration,
    pub max_attempts: u32,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: 120,
            heartbeat_interval: Duration::from_secs(30),
            max_processing_time: Duration::from_secs(30 * 60),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// One processing attempt, owned by the dispatch that created it.
#[derive(Debug, Clone)]
pub struct JobAttempt {
    pub job_id: JobId,
    pub started_at: Instant,
    /// 1-based.
    pub attempt: u32,
    /// When the message becomes visible again unless another heartbeat
    /// lands. Advanced by every successful extension.
    pub visibility_deadline: Instant,
}

// ---------------------------------------------------------------------------
// Attempt tracking
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct AttemptRecord {
    count: u32,
    last_seen: Instant,
}

#[derive(Debug, Default)]
struct AttemptTracker {
    attempts: HashMap<JobId, AttemptRecord>,
    in_flight: HashSet<JobId>,
}

impl AttemptTracker {
    /// Register a new attempt. `None` if the job is already in flight.
    fn begin(&mut self, job_id: &str, receive_count: u32, now: Instant) -> Option<u32> {
        if self.in_flight.contains(job_id) {
            return None;
        }

        self.attempts
            .retain(|_, record| now.duration_since(record.last_seen) < ATTEMPT_RECORD_TTL);

        let record = self
            .attempts
            .entry(job_id.to_string())
            .or_insert(AttemptRecord {
                count: 0,
                last_seen: now,
            });
        record.count = receive_count.max(record.count.saturating_add(1));
        record.last_seen = now;

        self.in_flight.insert(job_id.to_string());
        Some(record.count)
    }

    fn forget(&mut self, job_id: &str) {
        self.attempts.remove(job_id);
    }
}

/// Removes the job from the in-flight set when dropped.
struct InFlight<'a> {
    tracker: &'a Mutex<AttemptTracker>,
    job_id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        lock(self.tracker).in_flight.remove(&self.job_id);
    }
}

fn lock(tracker: &Mutex<AttemptTracker>) -> MutexGuard<'_, AttemptTracker> {
    tracker
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Runs single messages against the engine and settles them on the queue.
pub struct Dispatcher {
    queue: Arc<dyn JobQueue>,
    engine: Arc<dyn GenerationEngine>,
    completion: Option<Arc<dyn CompletionSink>>,
    status: Arc<StatusRegistry>,
    settings: DispatchSettings,
    tracker: Mutex<AttemptTracker>,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        engine: Arc<dyn GenerationEngine>,
        status: Arc<StatusRegistry>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            queue,
            engine,
            completion: None,
            status,
            settings,
            tracker: Mutex::new(AttemptTracker::default()),
        }
    }

    /// Deliver artifacts through `sink` before acknowledging successes.
    pub fn with_completion(mut self, sink: Arc<dyn CompletionSink>) -> Self {
        self.completion = Some(sink);
        self
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Process one message to a terminal decision for this delivery.
    pub async fn dispatch(&self, message: &QueueMessage) -> Outcome {
        let job = match JobMessage::parse(message) {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(
                    message_id = %message.message_id,
                    error = %e,
                    "Dropping malformed job message",
                );
                self.acknowledge(&message.receipt_handle, &message.message_id, None)
                    .await;
                self.status.increment(JobCounter::Failed);
                return Outcome::PermanentFailure;
            }
        };

        let now = Instant::now();
        let begun = lock(&self.tracker).begin(&job.job_id, job.receive_count, now);
        let Some(attempt) = begun else {
            tracing::info!(
                job_id = %job.job_id,
                message_id = %job.message_id,
                "Job already in flight in this worker, leaving duplicate delivery",
            );
            self.status.increment(JobCounter::Retried);
            return Outcome::RetryableFailure;
        };
        let _in_flight = InFlight {
            tracker: &self.tracker,
            job_id: job.job_id.clone(),
        };

        let mut attempt = JobAttempt {
            job_id: job.job_id.clone(),
            started_at: now,
            attempt,
            visibility_deadline: now
                + Duration::from_secs(u64::from(self.settings.visibility_timeout_secs)),
        };

        if attempt.attempt > self.settings.max_attempts {
            return self
                .dead_letter(&job, &attempt, "attempt limit reached before processing")
                .await;
        }

        tracing::info!(
            job_id = %attempt.job_id,
            message_id = %job.message_id,
            attempt = attempt.attempt,
            max_attempts = self.settings.max_attempts,
            "Processing job",
        );

        let result = {
            let (_heartbeat, deadline) = self.start_heartbeat(&job, attempt.visibility_deadline);
            let result = self.execute(&job).await;
            attempt.visibility_deadline = *deadline.borrow();
            result
        };

        let elapsed_ms = attempt.started_at.elapsed().as_millis() as u64;
        match result {
            Ok(()) => {
                self.acknowledge(&job.receipt_handle, &job.message_id, Some(&job.job_id))
                    .await;
                lock(&self.tracker).forget(&job.job_id);
                self.status.increment(JobCounter::Succeeded);
                tracing::info!(
                    job_id = %attempt.job_id,
                    attempt = attempt.attempt,
                    elapsed_ms,
                    "Job completed",
                );
                Outcome::Success
            }
            Err(EngineError::Terminal(reason)) => self.dead_letter(&job, &attempt, &reason).await,
            Err(EngineError::Transient(reason)) if attempt.attempt >= self.settings.max_attempts => {
                self.dead_letter(&job, &attempt, &reason).await
            }
            Err(EngineError::Transient(reason)) => {
                let visible_in_ms = attempt
                    .visibility_deadline
                    .saturating_duration_since(Instant::now())
                    .as_millis() as u64;
                tracing::warn!(
                    job_id = %attempt.job_id,
                    attempt = attempt.attempt,
                    max_attempts = self.settings.max_attempts,
                    elapsed_ms,
                    visible_in_ms,
                    error = %reason,
                    "Job failed, leaving it for redelivery",
                );
                self.status.increment(JobCounter::Retried);
                Outcome::RetryableFailure
            }
        }
    }

    /// Engine run under the processing ceiling, then artifact delivery.
    async fn execute(&self, job: &JobMessage) -> Result<(), EngineError> {
        let ceiling = self.settings.max_processing_time;
        let submitted =
            tokio::time::timeout(ceiling, self.engine.submit(&job.job_id, &job.workflow)).await;
        let result = match submitted {
            Ok(result) => result?,
            Err(_) => {
                if let Err(e) = self.engine.cancel(&job.job_id).await {
                    tracing::warn!(
                        job_id = %job.job_id,
                        error = %e,
                        "Failed to cancel engine run after the processing ceiling",
                    );
                }
                return Err(EngineError::Transient(format!(
                    "engine did not finish within {}s",
                    ceiling.as_secs()
                )));
            }
        };

        if let Some(sink) = &self.completion {
            sink.complete(&job.job_id, &result)
                .await
                .map_err(|e| EngineError::Transient(format!("artifact delivery failed: {e}")))?;
        }
        Ok(())
    }

    /// Spawn the visibility heartbeat for `job`. It runs until the
    /// returned guard is dropped; the receiver tracks the visibility
    /// deadline, starting from `deadline`.
    fn start_heartbeat(
        &self,
        job: &JobMessage,
        deadline: Instant,
    ) -> (DropGuard, watch::Receiver<Instant>) {
        let cancel = CancellationToken::new();
        let (deadline_tx, deadline_rx) = watch::channel(deadline);
        let heartbeat = Heartbeat {
            queue: Arc::clone(&self.queue),
            receipt_handle: job.receipt_handle.clone(),
            job_id: job.job_id.clone(),
            interval: self.settings.heartbeat_interval,
            extend_by: self.settings.visibility_timeout_secs,
            deadline: deadline_tx,
        };
        tokio::spawn(heartbeat.run(cancel.clone()));
        (cancel.drop_guard(), deadline_rx)
    }

    async fn dead_letter(&self, job: &JobMessage, attempt: &JobAttempt, reason: &str) -> Outcome {
        tracing::error!(
            job_id = %job.job_id,
            message_id = %job.message_id,
            attempt = attempt.attempt,
            max_attempts = self.settings.max_attempts,
            dead_letter = true,
            error = %reason,
            "Job dead-lettered",
        );
        self.acknowledge(&job.receipt_handle, &job.message_id, Some(&job.job_id))
            .await;
        lock(&self.tracker).forget(&job.job_id);
        self.status.increment(JobCounter::DeadLettered);
        Outcome::PermanentFailure
    }

    /// Delete the message. A failed delete only means the message may be
    /// delivered again, so it is logged and otherwise ignored.
    async fn acknowledge(&self, receipt_handle: &str, message_id: &str, job_id: Option<&str>) {
        if let Err(e) = self.queue.delete(receipt_handle).await {
            tracing::warn!(
                job_id,
                message_id,
                error = %e,
                "Failed to delete message; it may be redelivered",
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Heartbeat
// ---------------------------------------------------------------------------

struct Heartbeat {
    queue: Arc<dyn JobQueue>,
    receipt_handle: String,
    job_id: String,
    interval: Duration,
    extend_by: u32,
    deadline: watch::Sender<Instant>,
}

impl Heartbeat {
    /// Extend immediately, then every `interval` until cancelled.
    async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let extend_by = Duration::from_secs(u64::from(self.extend_by));

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let requested_at = Instant::now();
                    match self.queue.extend_visibility(&self.receipt_handle, self.extend_by).await {
                        Ok(()) => {
                            self.deadline.send_replace(requested_at + extend_by);
                            tracing::debug!(
                                job_id = %self.job_id,
                                extend_by_secs = self.extend_by,
                                "Visibility extended",
                            );
                        }
                        Err(e) => tracing::warn!(
                            job_id = %self.job_id,
                            error = %e,
                            "Visibility heartbeat failed",
                        ),
                    }
                }
            }
        }
    }
}
