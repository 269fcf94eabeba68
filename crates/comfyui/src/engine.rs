//! Worker-facing generation engine contract and its ComfyUI adapter.
//!
//! [`GenerationEngine::submit`] runs one workflow to completion and
//! reports either the produced artifacts or a failure classified as
//! [`EngineError::Transient`] (worth retrying later) or
//! [`EngineError::Terminal`] (the job itself is bad). A caller that gives
//! up on a run early must call [`GenerationEngine::cancel`] so the engine
//! does not keep executing a prompt nobody is waiting for.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::api::{ComfyUIApi, ComfyUIApiError};
use crate::history::{prompt_state, ArtifactRef, PromptState};

/// Default delay between `/history` polls while a prompt is running.
pub const DEFAULT_HISTORY_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Consecutive failed `/history` polls tolerated before giving up on
/// the prompt as transiently failed.
const MAX_CONSECUTIVE_POLL_ERRORS: u32 = 5;

/// Execution error fragments that indicate resource exhaustion on the
/// engine host rather than a broken workflow.
const RESOURCE_EXHAUSTION_MARKERS: &[&str] = &["out of memory", "outofmemory"];

/// Outcome of a successful generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationResult {
    /// Engine-side identifier of the executed prompt.
    pub prompt_id: String,
    /// Produced output files.
    pub artifacts: Vec<ArtifactRef>,
}

/// Generation failures, split by whether a later retry may succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// Engine unreachable, overloaded, timed out or out of resources.
    #[error("Transient engine failure: {0}")]
    Transient(String),

    /// The engine rejected or failed the workflow itself.
    #[error("Engine rejected job: {0}")]
    Terminal(String),
}

impl EngineError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<ComfyUIApiError> for EngineError {
    fn from(err: ComfyUIApiError) -> Self {
        if err.is_transient() {
            Self::Transient(err.to_string())
        } else {
            Self::Terminal(err.to_string())
        }
    }
}

/// Local generation engine as seen by the dispatcher.
#[async_trait]
pub trait GenerationEngine: Send + Sync {
    /// Run `workflow` for `job_id` until it finishes.
    async fn submit(
        &self,
        job_id: &str,
        workflow: &serde_json::Value,
    ) -> Result<GenerationResult, EngineError>;

    /// Download the bytes of a produced artifact.
    async fn fetch_artifact(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, EngineError>;

    /// Stop the run for `job_id` whose `submit` was abandoned. A no-op
    /// when nothing is running for it.
    async fn cancel(&self, _job_id: &str) -> Result<(), EngineError> {
        Ok(())
    }
}

/// [`GenerationEngine`] backed by a ComfyUI server's REST API.
#[derive(Clone)]
pub struct ComfyUiEngine {
    api: ComfyUIApi,
    poll_interval: Duration,
    /// Prompt ids of submitted runs not yet finished, by job id. An entry
    /// outlives a dropped `submit` future so `cancel` can still find it.
    active: Arc<Mutex<HashMap<String, String>>>,
}

impl ComfyUiEngine {
    pub fn new(api: ComfyUIApi) -> Self {
        Self {
            api,
            poll_interval: DEFAULT_HISTORY_POLL_INTERVAL,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Poll `/history` until the prompt leaves the pending state.
    async fn wait_for_completion(
        &self,
        job_id: &str,
        prompt_id: &str,
    ) -> Result<Vec<ArtifactRef>, EngineError> {
        let mut consecutive_errors = 0u32;

        loop {
            tokio::time::sleep(self.poll_interval).await;

            let history = match self.api.get_history(prompt_id).await {
                Ok(history) => {
                    consecutive_errors = 0;
                    history
                }
                Err(e) if e.is_transient() => {
                    consecutive_errors += 1;
                    tracing::warn!(
                        job_id,
                        prompt_id,
                        consecutive_errors,
                        error = %e,
                        "History poll failed",
                    );
                    if consecutive_errors >= MAX_CONSECUTIVE_POLL_ERRORS {
                        self.abandon(job_id, prompt_id).await;
                        return Err(EngineError::Transient(format!(
                            "lost track of prompt {prompt_id}: {e}"
                        )));
                    }
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            match prompt_state(prompt_id, &history) {
                PromptState::Pending => continue,
                PromptState::Succeeded(artifacts) => return Ok(artifacts),
                PromptState::Failed(message) => return Err(classify_execution_error(message)),
            }
        }
    }

    /// Best-effort removal of `prompt_id` from the engine: dropped from
    /// the pending queue, interrupted if it is already executing.
    async fn abandon(&self, job_id: &str, prompt_id: &str) {
        if let Err(e) = self.stop_prompt(prompt_id).await {
            tracing::warn!(job_id, prompt_id, error = %e, "Failed to cancel ComfyUI prompt");
        } else {
            tracing::info!(job_id, prompt_id, "ComfyUI prompt cancelled");
        }
    }

    async fn stop_prompt(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        self.api.cancel_execution(prompt_id).await?;
        if self.api.get_queue().await?.is_running(prompt_id) {
            self.api.interrupt(prompt_id).await?;
        }
        Ok(())
    }

    fn active(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl GenerationEngine for ComfyUiEngine {
    async fn submit(
        &self,
        job_id: &str,
        workflow: &serde_json::Value,
    ) -> Result<GenerationResult, EngineError> {
        let client_id = uuid::Uuid::new_v4().to_string();

        let response = self.api.submit_workflow(workflow, &client_id).await?;
        tracing::info!(
            job_id,
            prompt_id = %response.prompt_id,
            queue_position = response.number,
            "Workflow submitted to ComfyUI",
        );

        self.active()
            .insert(job_id.to_string(), response.prompt_id.clone());
        let finished = self.wait_for_completion(job_id, &response.prompt_id).await;
        self.active().remove(job_id);
        let artifacts = finished?;

        tracing::info!(
            job_id,
            prompt_id = %response.prompt_id,
            artifacts = artifacts.len(),
            "ComfyUI execution finished",
        );

        Ok(GenerationResult {
            prompt_id: response.prompt_id,
            artifacts,
        })
    }

    async fn fetch_artifact(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, EngineError> {
        Ok(self.api.view(artifact).await?)
    }

    async fn cancel(&self, job_id: &str) -> Result<(), EngineError> {
        let prompt_id = self.active().remove(job_id);
        let Some(prompt_id) = prompt_id else {
            return Ok(());
        };
        self.stop_prompt(&prompt_id).await?;
        tracing::info!(job_id, prompt_id = %prompt_id, "ComfyUI prompt cancelled");
        Ok(())
    }
}

/// Execution errors are terminal unless they look like resource
/// exhaustion on the engine host.
pub fn classify_execution_error(message: String) -> EngineError {
    let lowered = message.to_ascii_lowercase();
    if RESOURCE_EXHAUSTION_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
    {
        EngineError::Transient(message)
    } else {
        EngineError::Terminal(message)
    }
}
