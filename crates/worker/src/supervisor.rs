//! Worker lifecycle owner.
//!
//! [`WorkerSupervisor`] is what a host application holds. `start` returns
//! immediately after spawning the worker task on the current Tokio
//! runtime; `stop` cancels it and waits for a bounded grace period. The
//! shared [`StatusRegistry`] can be read from any thread at any time.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use imagex_cloud::queue::JobQueue;
use imagex_comfyui::engine::GenerationEngine;
use imagex_core::status::{StatusRegistry, StatusSnapshot, WorkerState};

use crate::completion::CompletionSink;
use crate::config::{WorkerConfig, WorkerSettings};
use crate::dispatcher::Dispatcher;
use crate::error::WorkerError;
use crate::poller::{Poller, PollerExit};

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

/// Collaborators the worker runs against.
pub struct Backends {
    pub queue: Arc<dyn JobQueue>,
    pub engine: Arc<dyn GenerationEngine>,
    pub completion: Option<Arc<dyn CompletionSink>>,
}

/// Builds [`Backends`] from validated settings. Called inside the worker
/// task on every start, so slow client construction never blocks `start`.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn build(&self, settings: &WorkerSettings) -> Result<Backends, WorkerError>;
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

struct RunningWorker {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    shutdown_grace: Duration,
}

pub struct WorkerSupervisor {
    /// A configuration that failed to load is kept and reported by
    /// every `start`.
    config: Result<WorkerConfig, WorkerError>,
    factory: Arc<dyn BackendFactory>,
    status: Arc<StatusRegistry>,
    running: Mutex<Option<RunningWorker>>,
}

impl WorkerSupervisor {
    pub fn new(config: WorkerConfig, factory: Arc<dyn BackendFactory>) -> Self {
        Self::with_loaded_config(Ok(config), factory)
    }

    /// Supervisor configured from the process environment. See
    /// [`WorkerConfig::from_env`].
    pub fn from_env(factory: Arc<dyn BackendFactory>) -> Self {
        Self::with_loaded_config(WorkerConfig::from_env(), factory)
    }

    /// Supervisor configured through `lookup`. A value that does not
    /// parse surfaces from [`start`](Self::start) as `ConfigError`.
    pub fn from_lookup<F>(lookup: F, factory: Arc<dyn BackendFactory>) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::with_loaded_config(WorkerConfig::from_lookup(lookup), factory)
    }

    fn with_loaded_config(
        config: Result<WorkerConfig, WorkerError>,
        factory: Arc<dyn BackendFactory>,
    ) -> Self {
        Self {
            config,
            factory,
            status: Arc::new(StatusRegistry::new()),
            running: Mutex::new(None),
        }
    }

    /// Validate the configuration and spawn the worker task.
    ///
    /// Must be called from within a Tokio runtime. An invalid
    /// configuration leaves the worker in `ConfigError` with the reason
    /// recorded as the last error.
    pub fn start(&self) -> Result<(), WorkerError> {
        let mut running = self.lock_running();
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return Err(WorkerError::AlreadyRunning);
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| WorkerError::Runtime(e.to_string()))?;

        self.status.set_state(WorkerState::Starting);
        self.status.clear_last_error();
        self.status.mark_started();

        let validated = self
            .config
            .as_ref()
            .map_err(Clone::clone)
            .and_then(WorkerConfig::validate);
        let settings = match validated {
            Ok(settings) => settings,
            Err(e) => {
                self.status.set_state(WorkerState::ConfigError);
                self.status.set_last_error(e.to_string());
                tracing::error!(error = %e, "Worker configuration is invalid");
                *running = None;
                return Err(e);
            }
        };

        tracing::info!(
            queue_url = %settings.queue_url,
            region = %settings.region,
            comfyui_url = %settings.comfyui_url,
            max_attempts = settings.dispatch.max_attempts,
            "Starting worker",
        );

        let cancel = CancellationToken::new();
        let shutdown_grace = settings.shutdown_grace;
        let task = runtime.spawn(run_worker(
            settings,
            Arc::clone(&self.factory),
            Arc::clone(&self.status),
            cancel.clone(),
        ));

        *running = Some(RunningWorker {
            cancel,
            task,
            shutdown_grace,
        });
        Ok(())
    }

    /// Cancel the worker and wait for it to finish.
    ///
    /// Cancellation is signalled before `Stopping` is committed, and the
    /// poller never overwrites `Stopping`, so the state cannot fall back
    /// to `Polling` during shutdown.
    ///
    /// An engine call in progress is given the configured grace period;
    /// after that the task is aborted and the job is left to its
    /// visibility timeout. A no-op when nothing is running.
    pub async fn stop(&self) {
        let running = self.lock_running().take();
        let Some(RunningWorker {
            cancel,
            mut task,
            shutdown_grace,
        }) = running
        else {
            return;
        };

        cancel.cancel();
        let _ = self
            .status
            .set_state_unless(WorkerState::Stopping, &[WorkerState::ConfigError]);

        match tokio::time::timeout(shutdown_grace, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "Worker task ended abnormally"),
            Err(_) => {
                tracing::warn!(
                    grace_secs = shutdown_grace.as_secs(),
                    "Worker did not stop within the grace period, aborting",
                );
                task.abort();
                // Cancellation is the expected result.
                let _ = task.await;
            }
        }

        let _ = self
            .status
            .set_state_unless(WorkerState::Stopped, &[WorkerState::ConfigError]);
        tracing::info!(state = %self.status.state(), "Worker stopped");
    }

    /// Whether a worker task is currently alive.
    pub fn is_running(&self) -> bool {
        self.lock_running()
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }

    /// Shared registry, for hosts that poll the state themselves.
    pub fn status(&self) -> Arc<StatusRegistry> {
        Arc::clone(&self.status)
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.status.snapshot()
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<RunningWorker>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for WorkerSupervisor {
    fn drop(&mut self) {
        if let Some(running) = self.lock_running().as_ref() {
            running.cancel.cancel();
        }
    }
}

/// Body of the worker task.
async fn run_worker(
    settings: WorkerSettings,
    factory: Arc<dyn BackendFactory>,
    status: Arc<StatusRegistry>,
    cancel: CancellationToken,
) {
    let built = tokio::select! {
        _ = cancel.cancelled() => return,
        built = factory.build(&settings) => built,
    };

    let backends = match built {
        Ok(backends) => backends,
        Err(e) => {
            status.set_state(WorkerState::ConfigError);
            status.set_last_error(e.to_string());
            tracing::error!(error = %e, "Failed to initialise worker backends");
            return;
        }
    };

    let mut dispatcher = Dispatcher::new(
        Arc::clone(&backends.queue),
        backends.engine,
        Arc::clone(&status),
        settings.dispatch,
    );
    if let Some(sink) = backends.completion {
        dispatcher = dispatcher.with_completion(sink);
    }

    let mut poller = Poller::new(
        backends.queue,
        dispatcher,
        Arc::clone(&status),
        settings.poll,
        settings.retry,
    );

    match poller.run(cancel).await {
        PollerExit::Cancelled => tracing::info!("Worker loop exited"),
        PollerExit::ConfigError => {
            let last_error = status.last_error().unwrap_or_default();
            tracing::error!(last_error = %last_error, "Worker halted on configuration error");
        }
    }
}
