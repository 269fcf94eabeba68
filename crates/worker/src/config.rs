use std::str::FromStr;
use std::time::Duration;

use imagex_core::retry::{
    RetryPolicy, DEFAULT_BASE_DELAY, DEFAULT_JITTER_FRACTION, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_MAX_DELAY,
};

use crate::dispatcher::DispatchSettings;
use crate::error::WorkerError;
use crate::poller::PollSettings;

/// Largest batch a single SQS receive may return.
const MAX_BATCH_SIZE: u32 = 10;

/// Longest server-side long-poll wait SQS accepts.
const MAX_POLL_WAIT_SECS: u32 = 20;

/// SQS caps visibility timeouts at 12 hours.
const MAX_VISIBILITY_TIMEOUT_SECS: u32 = 12 * 60 * 60;

/// Raw worker configuration, as read from the environment.
///
/// Loading only parses values; cross-field checks happen in
/// [`validate`](Self::validate), which the supervisor runs on every start
/// so a bad configuration surfaces as the `ConfigError` worker state.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Job queue URL. Required.
    pub queue_url: Option<String>,
    /// AWS region for every AWS client (default: `us-east-1`).
    pub region: String,
    /// Long-poll wait per receive, in seconds (default: `20`).
    pub poll_wait_secs: u32,
    /// Messages requested per receive (default: `1`).
    pub max_messages: u32,
    /// ComfyUI base URL (default: `http://127.0.0.1:8188`).
    pub comfyui_url: String,
    /// Visibility timeout applied by every heartbeat (default: `120`).
    pub visibility_timeout_secs: u32,
    /// Seconds between heartbeats (default: `30`).
    pub heartbeat_interval_secs: u64,
    /// Hard ceiling on one engine run, in seconds (default: `1800`).
    pub max_processing_secs: u64,
    /// Processing attempts per job before dead-lettering (default: `5`).
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_jitter: f64,
    /// How long `stop` waits for the worker task before aborting it.
    pub shutdown_grace_secs: u64,
    /// Artifact bucket. Uploads are skipped when unset.
    pub output_bucket: Option<String>,
    /// Key prefix for uploaded artifacts (default: `outputs`).
    pub output_prefix: String,
    /// Completion event queue. Publishing is skipped when unset.
    pub completion_queue_url: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_url: None,
            region: "us-east-1".into(),
            poll_wait_secs: MAX_POLL_WAIT_SECS,
            max_messages: 1,
            comfyui_url: "http://127.0.0.1:8188".into(),
            visibility_timeout_secs: 120,
            heartbeat_interval_secs: 30,
            max_processing_secs: 30 * 60,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base_ms: DEFAULT_BASE_DELAY.as_millis() as u64,
            backoff_max_ms: DEFAULT_MAX_DELAY.as_millis() as u64,
            backoff_jitter: DEFAULT_JITTER_FRACTION,
            shutdown_grace_secs: 30,
            output_bucket: None,
            output_prefix: "outputs".into(),
            completion_queue_url: None,
        }
    }
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                          | Default                 |
    /// |----------------------------------|-------------------------|
    /// | `IMAGEX_QUEUE_URL`               | required                |
    /// | `AWS_REGION`                     | `us-east-1`             |
    /// | `IMAGEX_POLL_WAIT_SECS`          | `20`                    |
    /// | `IMAGEX_MAX_MESSAGES`            | `1`                     |
    /// | `COMFYUI_API_URL`                | `http://127.0.0.1:8188` |
    /// | `IMAGEX_VISIBILITY_TIMEOUT_SECS` | `120`                   |
    /// | `IMAGEX_HEARTBEAT_INTERVAL_SECS` | `30`                    |
    /// | `IMAGEX_MAX_PROCESSING_SECS`     | `1800`                  |
    /// | `IMAGEX_MAX_ATTEMPTS`            | `5`                     |
    /// | `IMAGEX_BACKOFF_BASE_MS`         | `1000`                  |
    /// | `IMAGEX_BACKOFF_MAX_MS`          | `60000`                 |
    /// | `IMAGEX_BACKOFF_JITTER`          | `0.2`                   |
    /// | `IMAGEX_SHUTDOWN_GRACE_SECS`     | `30`                    |
    /// | `IMAGEX_OUTPUT_BUCKET`           | unset (no upload)       |
    /// | `IMAGEX_OUTPUT_PREFIX`           | `outputs`               |
    /// | `IMAGEX_COMPLETION_QUEUE_URL`    | unset (no publish)      |
    ///
    /// A value that is set but does not parse is a configuration error.
    pub fn from_env() -> Result<Self, WorkerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, WorkerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let text = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Ok(Self {
            queue_url: text("IMAGEX_QUEUE_URL"),
            region: text("AWS_REGION").unwrap_or(defaults.region),
            poll_wait_secs: parse_var(&lookup, "IMAGEX_POLL_WAIT_SECS", defaults.poll_wait_secs)?,
            max_messages: parse_var(&lookup, "IMAGEX_MAX_MESSAGES", defaults.max_messages)?,
            comfyui_url: text("COMFYUI_API_URL").unwrap_or(defaults.comfyui_url),
            visibility_timeout_secs: parse_var(
                &lookup,
                "IMAGEX_VISIBILITY_TIMEOUT_SECS",
                defaults.visibility_timeout_secs,
            )?,
            heartbeat_interval_secs: parse_var(
                &lookup,
                "IMAGEX_HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval_secs,
            )?,
            max_processing_secs: parse_var(
                &lookup,
                "IMAGEX_MAX_PROCESSING_SECS",
                defaults.max_processing_secs,
            )?,
            max_attempts: parse_var(&lookup, "IMAGEX_MAX_ATTEMPTS", defaults.max_attempts)?,
            backoff_base_ms: parse_var(&lookup, "IMAGEX_BACKOFF_BASE_MS", defaults.backoff_base_ms)?,
            backoff_max_ms: parse_var(&lookup, "IMAGEX_BACKOFF_MAX_MS", defaults.backoff_max_ms)?,
            backoff_jitter: parse_var(&lookup, "IMAGEX_BACKOFF_JITTER", defaults.backoff_jitter)?,
            shutdown_grace_secs: parse_var(
                &lookup,
                "IMAGEX_SHUTDOWN_GRACE_SECS",
                defaults.shutdown_grace_secs,
            )?,
            output_bucket: text("IMAGEX_OUTPUT_BUCKET"),
            output_prefix: text("IMAGEX_OUTPUT_PREFIX").unwrap_or(defaults.output_prefix),
            completion_queue_url: text("IMAGEX_COMPLETION_QUEUE_URL"),
        })
    }

    /// Check ranges and cross-field constraints and derive the typed
    /// settings each component consumes.
    pub fn validate(&self) -> Result<WorkerSettings, WorkerError> {
        let queue_url = self
            .queue_url
            .clone()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| WorkerError::Config("IMAGEX_QUEUE_URL is not set".into()))?;

        if !(1..=MAX_BATCH_SIZE).contains(&self.max_messages) {
            return Err(WorkerError::Config(format!(
                "IMAGEX_MAX_MESSAGES must be within 1..={MAX_BATCH_SIZE}, got {}",
                self.max_messages
            )));
        }
        if self.poll_wait_secs > MAX_POLL_WAIT_SECS {
            return Err(WorkerError::Config(format!(
                "IMAGEX_POLL_WAIT_SECS must be at most {MAX_POLL_WAIT_SECS}, got {}",
                self.poll_wait_secs
            )));
        }
        if self.visibility_timeout_secs == 0
            || self.visibility_timeout_secs > MAX_VISIBILITY_TIMEOUT_SECS
        {
            return Err(WorkerError::Config(format!(
                "IMAGEX_VISIBILITY_TIMEOUT_SECS must be within 1..={MAX_VISIBILITY_TIMEOUT_SECS}, got {}",
                self.visibility_timeout_secs
            )));
        }
        if self.heartbeat_interval_secs == 0
            || self.heartbeat_interval_secs >= u64::from(self.visibility_timeout_secs)
        {
            return Err(WorkerError::Config(format!(
                "IMAGEX_HEARTBEAT_INTERVAL_SECS ({}) must be positive and below the visibility timeout ({})",
                self.heartbeat_interval_secs, self.visibility_timeout_secs
            )));
        }
        if self.max_processing_secs == 0 {
            return Err(WorkerError::Config(
                "IMAGEX_MAX_PROCESSING_SECS must be positive".into(),
            ));
        }
        if self.completion_queue_url.is_some() && self.output_bucket.is_none() {
            return Err(WorkerError::Config(
                "IMAGEX_COMPLETION_QUEUE_URL requires IMAGEX_OUTPUT_BUCKET".into(),
            ));
        }

        let retry = RetryPolicy::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
            self.max_attempts,
            self.backoff_jitter,
        )?;

        let output = self.output_bucket.as_ref().map(|bucket| OutputSettings {
            bucket: bucket.clone(),
            prefix: self.output_prefix.trim_matches('/').to_string(),
            completion_queue_url: self.completion_queue_url.clone(),
        });

        Ok(WorkerSettings {
            queue_url,
            region: self.region.clone(),
            comfyui_url: self.comfyui_url.clone(),
            poll: PollSettings {
                max_messages: self.max_messages,
                wait_secs: self.poll_wait_secs,
            },
            dispatch: DispatchSettings {
                visibility_timeout_secs: self.visibility_timeout_secs,
                heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
                max_processing_time: Duration::from_secs(self.max_processing_secs),
                max_attempts: retry.max_attempts(),
            },
            retry,
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            output,
        })
    }
}

/// Validated configuration, split per component.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub queue_url: String,
    pub region: String,
    pub comfyui_url: String,
    pub poll: PollSettings,
    pub dispatch: DispatchSettings,
    pub retry: RetryPolicy,
    pub shutdown_grace: Duration,
    pub output: Option<OutputSettings>,
}

/// Where finished artifacts go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSettings {
    pub bucket: String,
    /// Key prefix without leading or trailing slashes. May be empty.
    pub prefix: String,
    pub completion_queue_url: Option<String>,
}

fn parse_var<T, F>(lookup: &F, key: &str, default: T) -> Result<T, WorkerError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|v| v.trim().to_string()) {
        None => Ok(default),
        Some(v) if v.is_empty() => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|e| WorkerError::Config(format!("{key} must be a valid number, got {v:?}: {e}"))),
    }
}
