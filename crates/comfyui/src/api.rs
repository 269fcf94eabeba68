//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps workflow submission, cancellation, history retrieval and
//! output download using [`reqwest`].

use std::time::Duration;

use serde::Deserialize;

use crate::history::ArtifactRef;

/// Per-request timeout. Generation itself is tracked through the
/// history endpoint, so no single request should take long.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for a single ComfyUI instance.
#[derive(Clone)]
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Response returned by the ComfyUI `/prompt` endpoint after
/// successfully queuing a workflow.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: i64,
}

/// Body of `GET /queue`. Each entry is
/// `[number, prompt_id, prompt, extra_data, outputs_to_execute]`.
#[derive(Debug, Default, Deserialize)]
pub struct QueueSnapshot {
    #[serde(default)]
    pub queue_running: Vec<Vec<serde_json::Value>>,
    #[serde(default)]
    pub queue_pending: Vec<Vec<serde_json::Value>>,
}

impl QueueSnapshot {
    /// Whether `prompt_id` is the one currently executing.
    pub fn is_running(&self, prompt_id: &str) -> bool {
        self.queue_running
            .iter()
            .any(|entry| entry.get(1).and_then(|id| id.as_str()) == Some(prompt_id))
    }
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, TLS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// The configured base URL cannot be turned into a request URL.
    #[error("Invalid ComfyUI URL: {0}")]
    InvalidUrl(String),
}

impl ComfyUIApiError {
    /// Whether retrying the same request later could succeed.
    ///
    /// Transport failures, 408, 429 and 5xx are transient. Any other
    /// status means ComfyUI rejected the request itself (e.g. a workflow
    /// with invalid nodes), which will not change on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(_) => true,
            Self::ApiError { status, .. } => {
                *status == 408 || *status == 429 || (500..=599).contains(status)
            }
            Self::InvalidUrl(_) => false,
        }
    }
}

impl ComfyUIApi {
    /// Create a new API client for a ComfyUI instance.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8188`.
    pub fn new(api_url: impl Into<String>) -> Result<Self, ComfyUIApiError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self::with_client(client, api_url))
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        Self { client, api_url }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Submit a workflow for execution.
    ///
    /// Sends a `POST /prompt` request with the given workflow JSON and
    /// client ID.  Returns the server-assigned `prompt_id` and queue
    /// position.
    pub async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Remove a pending prompt from the execution queue.
    ///
    /// Sends a `POST /queue` request with a `delete` list. A prompt that
    /// has already started is not affected; see [`interrupt`](Self::interrupt).
    pub async fn cancel_execution(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        let body = serde_json::json!({
            "delete": [prompt_id],
        });

        let response = self
            .client
            .post(format!("{}/queue", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::ensure_success(response).await.map(drop)
    }

    /// Interrupt the running execution.
    ///
    /// Sends a `POST /interrupt` request naming `prompt_id`. Servers that
    /// predate targeted interrupts stop whatever is executing right now.
    pub async fn interrupt(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt_id": prompt_id,
        });

        let response = self
            .client
            .post(format!("{}/interrupt", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::ensure_success(response).await.map(drop)
    }

    /// Read the execution queue via `GET /queue`.
    pub async fn get_queue(&self) -> Result<QueueSnapshot, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/queue", self.api_url))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Retrieve execution history for a specific prompt.
    ///
    /// Sends a `GET /history/{prompt_id}` request. The body is `{}` until
    /// the prompt has finished executing.
    pub async fn get_history(&self, prompt_id: &str) -> Result<serde_json::Value, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Download a produced output file via `GET /view`.
    pub async fn view(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, ComfyUIApiError> {
        let url = reqwest::Url::parse_with_params(
            &format!("{}/view", self.api_url),
            &[
                ("filename", artifact.filename.as_str()),
                ("subfolder", artifact.subfolder.as_str()),
                ("type", artifact.kind.as_str()),
            ],
        )
        .map_err(|e| ComfyUIApiError::InvalidUrl(e.to_string()))?;

        let response = self.client.get(url).send().await?;
        let response = Self::ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ComfyUIApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}
