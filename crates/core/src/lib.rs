//! Shared building blocks for the imagex intake worker.
//!
//! Pure policy and state types with no I/O: the retry/backoff
//! controller, the worker status registry, and the common error and
//! identifier types used across the workspace.

pub mod error;
pub mod retry;
pub mod status;
pub mod types;
