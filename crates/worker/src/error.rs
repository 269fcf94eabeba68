use imagex_core::error::CoreError;

/// Errors surfaced by the worker to its host.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkerError {
    /// Missing or invalid settings. The worker cannot run until an
    /// operator fixes the configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A collaborator client (queue, engine, storage) could not be built.
    #[error("Backend initialisation failed: {0}")]
    Backend(String),

    /// `start` was called while a worker task is still alive.
    #[error("Worker is already running")]
    AlreadyRunning,

    /// `start` was called outside of a Tokio runtime.
    #[error("No Tokio runtime available: {0}")]
    Runtime(String),
}

impl From<CoreError> for WorkerError {
    fn from(err: CoreError) -> Self {
        Self::Config(err.to_string())
    }
}
