//! ComfyUI REST client and generation engine adapter.
//!
//! [`api::ComfyUIApi`] wraps the HTTP endpoints the worker needs
//! (workflow submission, history lookup, output download).
//! [`engine::ComfyUiEngine`] builds the worker-facing
//! [`engine::GenerationEngine`] contract on top of it: submit, poll the
//! history until the prompt finishes, and classify failures as transient
//! or terminal.

pub mod api;
pub mod engine;
pub mod history;
