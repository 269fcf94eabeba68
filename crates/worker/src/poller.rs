//! The queue polling loop.
//!
//! Long-polls the job queue and hands every received message to the
//! [`Dispatcher`], one at a time in receive order. Queue-level failures
//! are split the same way [`QueueError`] splits them: transient ones put
//! the worker into `Backoff` and are retried forever with bounded delays,
//! permanent ones put it into `ConfigError` and end the loop.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use imagex_cloud::queue::{JobQueue, QueueError};
use imagex_core::retry::{Backoff, RetryPolicy};
use imagex_core::status::{StatusRegistry, WorkerState};

use crate::dispatcher::Dispatcher;

/// States the poller never overwrites.
const SUPERVISOR_OWNED: [WorkerState; 3] = [
    WorkerState::Stopping,
    WorkerState::Stopped,
    WorkerState::ConfigError,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Messages requested per receive (1..=10).
    pub max_messages: u32,
    /// Server-side long-poll wait (0..=20 seconds).
    pub wait_secs: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            max_messages: 1,
            wait_secs: 20,
        }
    }
}

/// Why [`Poller::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerExit {
    Cancelled,
    /// The queue reported an error no retry can fix.
    ConfigError,
}

pub struct Poller {
    queue: Arc<dyn JobQueue>,
    dispatcher: Dispatcher,
    status: Arc<StatusRegistry>,
    settings: PollSettings,
    backoff: Backoff,
}

impl Poller {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        dispatcher: Dispatcher,
        status: Arc<StatusRegistry>,
        settings: PollSettings,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            queue,
            dispatcher,
            status,
            settings,
            backoff: Backoff::new(policy),
        }
    }

    /// Consecutive failed receives in the current backoff streak.
    pub fn backoff_streak(&self) -> u32 {
        self.backoff.attempt()
    }

    /// Run until `cancel` fires or the queue turns out to be unusable.
    ///
    /// Receives and backoff sleeps are abandoned as soon as `cancel`
    /// fires. A dispatch already in progress runs to completion;
    /// messages later in the same batch are left to their visibility
    /// timeout.
    pub async fn run(&mut self, cancel: CancellationToken) -> PollerExit {
        tracing::info!(
            max_messages = self.settings.max_messages,
            wait_secs = self.settings.wait_secs,
            "Queue poller started",
        );

        loop {
            if self.status.state() == WorkerState::ConfigError {
                return PollerExit::ConfigError;
            }
            if cancel.is_cancelled() {
                tracing::info!("Queue poller shutting down");
                return PollerExit::Cancelled;
            }

            let visibility = self.dispatcher.settings().visibility_timeout_secs;
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("Queue poller shutting down during receive");
                    return PollerExit::Cancelled;
                }
                received = self.queue.receive(
                    self.settings.max_messages,
                    self.settings.wait_secs,
                    Some(visibility),
                ) => received,
            };

            match received {
                Ok(messages) => {
                    if self.backoff.attempt() > 0 {
                        tracing::info!(
                            failed_receives = self.backoff.attempt(),
                            "Queue reachable again",
                        );
                    }
                    self.backoff.reset();
                    self.status.clear_last_error();
                    self.enter(WorkerState::Polling, &cancel);

                    for (index, message) in messages.iter().enumerate() {
                        if cancel.is_cancelled() {
                            tracing::info!(
                                left_for_redelivery = messages.len() - index,
                                "Shutdown requested mid-batch",
                            );
                            break;
                        }
                        let outcome = self.dispatcher.dispatch(message).await;
                        tracing::debug!(
                            message_id = %message.message_id,
                            ?outcome,
                            "Message dispatched",
                        );
                    }
                }
                Err(QueueError::Transient(reason)) => {
                    self.enter(WorkerState::Backoff, &cancel);
                    self.status.set_last_error(reason.as_str());
                    let delay = self.backoff.next_delay();
                    tracing::warn!(
                        attempt = self.backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "Queue receive failed, backing off",
                    );

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            tracing::info!("Queue poller shutting down during backoff");
                            return PollerExit::Cancelled;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(QueueError::Permanent(reason)) => {
                    self.status.set_state(WorkerState::ConfigError);
                    self.status.set_last_error(reason.as_str());
                    tracing::error!(
                        state = %WorkerState::ConfigError,
                        error = %reason,
                        "Queue rejected the worker; fix the configuration and restart",
                    );
                    return PollerExit::ConfigError;
                }
            }
        }
    }

    /// Commit `state` unless shutdown has begun. Once the supervisor has
    /// written `Stopping` (or the worker is halted) the state is left alone.
    fn enter(&self, state: WorkerState, cancel: &CancellationToken) {
        if cancel.is_cancelled() {
            return;
        }
        match self.status.set_state_unless(state, &SUPERVISOR_OWNED) {
            Ok(previous) if previous != state => {
                tracing::debug!(from = %previous, to = %state, "Worker state changed");
            }
            Ok(_) => {}
            Err(current) => {
                tracing::debug!(state = %current, skipped = %state, "State owned by supervisor");
            }
        }
    }
}
