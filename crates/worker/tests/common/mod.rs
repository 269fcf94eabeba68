//! Shared fakes and helpers for the worker integration tests.
//!
//! The queue side uses [`MemoryQueue`] (optionally wrapped in
//! [`RecordingQueue`] to capture receive timing); the engine side uses
//! [`FakeEngine`], which replays a script of results.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use imagex_cloud::memory::MemoryQueue;
use imagex_cloud::queue::{JobQueue, QueueError, QueueMessage};
use imagex_comfyui::engine::{EngineError, GenerationEngine, GenerationResult};
use imagex_comfyui::history::ArtifactRef;
use imagex_core::retry::RetryPolicy;
use imagex_core::status::{StatusRegistry, WorkerState};
use imagex_worker::completion::CompletionSink;
use imagex_worker::config::{WorkerConfig, WorkerSettings};
use imagex_worker::dispatcher::DispatchSettings;
use imagex_worker::error::WorkerError;
use imagex_worker::supervisor::{BackendFactory, Backends};

// ---------------------------------------------------------------------------
// Messages and settings
// ---------------------------------------------------------------------------

/// Well-formed envelope for `job_id` with a JSON-string payload.
pub fn job_body(job_id: &str) -> String {
    let payload = serde_json::json!({
        "prompt": { "3": { "class_type": "KSampler", "inputs": { "seed": 42 } } }
    })
    .to_string();
    serde_json::json!({ "metadata": { "jobId": job_id }, "payload": payload }).to_string()
}

/// Deterministic backoff: no jitter.
pub fn no_jitter_policy(base_ms: u64, max_ms: u64) -> RetryPolicy {
    RetryPolicy::new(
        Duration::from_millis(base_ms),
        Duration::from_millis(max_ms),
        3,
        0.0,
    )
    .unwrap()
}

pub fn dispatch_settings() -> DispatchSettings {
    DispatchSettings {
        visibility_timeout_secs: 3,
        heartbeat_interval: Duration::from_secs(1),
        max_processing_time: Duration::from_secs(60),
        max_attempts: 3,
    }
}

/// Valid configuration with short timings suited to paused-clock tests.
pub fn test_config() -> WorkerConfig {
    WorkerConfig {
        queue_url: Some("memory://jobs".into()),
        poll_wait_secs: 1,
        visibility_timeout_secs: 3,
        heartbeat_interval_secs: 1,
        max_processing_secs: 60,
        max_attempts: 3,
        backoff_base_ms: 100,
        backoff_max_ms: 1_000,
        backoff_jitter: 0.0,
        shutdown_grace_secs: 5,
        ..WorkerConfig::default()
    }
}

/// Poll `condition` every 10ms of (usually paused) time; panic after
/// ten virtual minutes.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(600);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_state(status: &StatusRegistry, state: WorkerState) {
    wait_until(&format!("state {state}"), || status.state() == state).await;
}

// ---------------------------------------------------------------------------
// FakeEngine
// ---------------------------------------------------------------------------

/// Engine that takes `delay` per job and replays scripted results.
/// Once the script runs out every job gets `fallback`.
pub struct FakeEngine {
    delay: Duration,
    script: Mutex<VecDeque<Result<(), EngineError>>>,
    fallback: Result<(), EngineError>,
    calls: AtomicU32,
    jobs: Mutex<Vec<String>>,
    cancelled: Mutex<Vec<String>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            script: Mutex::new(VecDeque::new()),
            fallback: Ok(()),
            calls: AtomicU32::new(0),
            jobs: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_with(mut self, error: EngineError) -> Self {
        self.fallback = Err(error);
        self
    }

    pub fn push(&self, result: Result<(), EngineError>) {
        self.script.lock().unwrap().push_back(result);
    }

    /// Number of `submit` calls so far, counted when the call starts.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn jobs(&self) -> Vec<String> {
        self.jobs.lock().unwrap().clone()
    }

    /// Job ids passed to `cancel`, in call order.
    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerationEngine for FakeEngine {
    async fn submit(
        &self,
        job_id: &str,
        workflow: &serde_json::Value,
    ) -> Result<GenerationResult, EngineError> {
        assert!(workflow.is_object(), "engine got a non-object workflow");
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.jobs.lock().unwrap().push(job_id.to_string());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())?;

        Ok(GenerationResult {
            prompt_id: format!("prompt-{job_id}"),
            artifacts: vec![ArtifactRef {
                filename: format!("{job_id}.png"),
                subfolder: String::new(),
                kind: "output".into(),
            }],
        })
    }

    async fn fetch_artifact(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, EngineError> {
        Ok(artifact.filename.as_bytes().to_vec())
    }

    async fn cancel(&self, job_id: &str) -> Result<(), EngineError> {
        self.cancelled.lock().unwrap().push(job_id.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RecordingQueue
// ---------------------------------------------------------------------------

/// [`MemoryQueue`] that remembers when each receive happened, which
/// worker state was committed at that moment and the visibility asked for.
pub struct RecordingQueue {
    pub inner: MemoryQueue,
    status: Arc<StatusRegistry>,
    receives: Mutex<Vec<(Instant, WorkerState)>>,
    visibility_requests: Mutex<Vec<Option<u32>>>,
}

impl RecordingQueue {
    pub fn new(status: Arc<StatusRegistry>) -> Self {
        Self {
            inner: MemoryQueue::new(),
            status,
            receives: Mutex::new(Vec::new()),
            visibility_requests: Mutex::new(Vec::new()),
        }
    }

    pub fn receives(&self) -> Vec<(Instant, WorkerState)> {
        self.receives.lock().unwrap().clone()
    }

    pub fn visibility_requests(&self) -> Vec<Option<u32>> {
        self.visibility_requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobQueue for RecordingQueue {
    async fn receive(
        &self,
        max_messages: u32,
        wait_secs: u32,
        visibility_timeout_secs: Option<u32>,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        self.receives
            .lock()
            .unwrap()
            .push((Instant::now(), self.status.state()));
        self.visibility_requests
            .lock()
            .unwrap()
            .push(visibility_timeout_secs);
        self.inner
            .receive(max_messages, wait_secs, visibility_timeout_secs)
            .await
    }

    async fn extend_visibility(&self, receipt_handle: &str, secs: u32) -> Result<(), QueueError> {
        self.inner.extend_visibility(receipt_handle, secs).await
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        self.inner.delete(receipt_handle).await
    }
}

// ---------------------------------------------------------------------------
// Backend factories
// ---------------------------------------------------------------------------

/// Hands out the same pre-built collaborators on every start.
pub struct StaticFactory {
    pub queue: Arc<dyn JobQueue>,
    pub engine: Arc<dyn GenerationEngine>,
    pub completion: Option<Arc<dyn CompletionSink>>,
}

impl StaticFactory {
    pub fn new(queue: Arc<dyn JobQueue>, engine: Arc<dyn GenerationEngine>) -> Arc<Self> {
        Arc::new(Self {
            queue,
            engine,
            completion: None,
        })
    }
}

#[async_trait]
impl BackendFactory for StaticFactory {
    async fn build(&self, _settings: &WorkerSettings) -> Result<Backends, WorkerError> {
        Ok(Backends {
            queue: Arc::clone(&self.queue),
            engine: Arc::clone(&self.engine),
            completion: self.completion.clone(),
        })
    }
}

/// Factory whose clients can never be built.
pub struct FailingFactory;

#[async_trait]
impl BackendFactory for FailingFactory {
    async fn build(&self, _settings: &WorkerSettings) -> Result<Backends, WorkerError> {
        Err(WorkerError::Backend("ComfyUI client: invalid URL".into()))
    }
}
