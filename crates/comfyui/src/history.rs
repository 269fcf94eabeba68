//! Interpretation of ComfyUI `/history/{prompt_id}` responses.
//!
//! A finished prompt shows up as
//! `{ "<prompt_id>": { "outputs": {...}, "status": {...} } }`; an
//! unfinished one is simply absent.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Output keys that carry produced files.
const OUTPUT_FILE_KEYS: &[&str] = &["images", "gifs", "videos"];

/// File type ComfyUI uses for saved (non-preview) outputs.
const OUTPUT_KIND: &str = "output";

/// A file produced by a finished prompt, as referenced by `/view`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
}

fn default_kind() -> String {
    OUTPUT_KIND.to_string()
}

/// Where a prompt stands according to its history entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptState {
    /// Not in the history yet; still queued or running.
    Pending,
    /// Finished; saved output files across all output nodes.
    Succeeded(Vec<ArtifactRef>),
    /// Execution failed inside ComfyUI.
    Failed(String),
}

/// Determine the state of `prompt_id` from a `/history` response body.
pub fn prompt_state(prompt_id: &str, history: &Value) -> PromptState {
    let Some(entry) = history.get(prompt_id) else {
        return PromptState::Pending;
    };

    let status = entry.get("status");
    let status_str = status
        .and_then(|s| s.get("status_str"))
        .and_then(Value::as_str);
    let completed = status
        .and_then(|s| s.get("completed"))
        .and_then(Value::as_bool);

    if status_str == Some("error") {
        return PromptState::Failed(execution_error_message(status));
    }

    // Older ComfyUI builds omit `status` entirely; presence in the history
    // then means the prompt finished.
    if status.is_none() || status_str == Some("success") || completed == Some(true) {
        return PromptState::Succeeded(collect_artifacts(entry));
    }

    PromptState::Pending
}

/// Pull the `execution_error` message out of `status.messages`.
fn execution_error_message(status: Option<&Value>) -> String {
    let messages = status
        .and_then(|s| s.get("messages"))
        .and_then(Value::as_array);

    messages
        .into_iter()
        .flatten()
        .filter_map(Value::as_array)
        .find(|pair| pair.first().and_then(Value::as_str) == Some("execution_error"))
        .and_then(|pair| pair.get(1))
        .map(|data| {
            let node = data.get("node_id").and_then(Value::as_str).unwrap_or("?");
            let message = data
                .get("exception_message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            match data.get("exception_type").and_then(Value::as_str) {
                Some(kind) => format!("node {node} ({kind}): {}", message.trim()),
                None => format!("node {node}: {}", message.trim()),
            }
        })
        .unwrap_or_else(|| "execution failed".to_string())
}

/// Saved output files across all nodes.
fn collect_artifacts(entry: &Value) -> Vec<ArtifactRef> {
    let Some(outputs) = entry.get("outputs").and_then(Value::as_object) else {
        return Vec::new();
    };

    let mut artifacts = Vec::new();
    for node_output in outputs.values() {
        for key in OUTPUT_FILE_KEYS {
            let Some(files) = node_output.get(*key).and_then(Value::as_array) else {
                continue;
            };
            for file in files {
                match serde_json::from_value::<ArtifactRef>(file.clone()) {
                    Ok(artifact) if artifact.kind == OUTPUT_KIND => artifacts.push(artifact),
                    Ok(_) => {}
                    Err(e) => tracing::debug!(error = %e, "Skipping unrecognised output entry"),
                }
            }
        }
    }
    artifacts
}
