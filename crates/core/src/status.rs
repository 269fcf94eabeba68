//! Worker lifecycle state shared between the worker task and observers.
//!
//! [`StatusRegistry`] is the single source of truth for "what is the
//! worker doing right now". The state itself is a single `u8` atomic, so
//! readers on any thread (including a host UI thread) never block and
//! never observe a torn value. Only the worker task and its supervisor
//! write to it.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::RwLock;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;

use crate::types::Timestamp;

// ---------------------------------------------------------------------------
// WorkerState
// ---------------------------------------------------------------------------

/// Lifecycle state of the background worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum WorkerState {
    Uninitialized = 0,
    Starting = 1,
    Polling = 2,
    Backoff = 3,
    Stopping = 4,
    Stopped = 5,
    /// Misconfigured; needs operator intervention and a restart.
    ConfigError = 6,
}

impl WorkerState {
    pub const ALL: [WorkerState; 7] = [
        Self::Uninitialized,
        Self::Starting,
        Self::Polling,
        Self::Backoff,
        Self::Stopping,
        Self::Stopped,
        Self::ConfigError,
    ];

    /// Decode the atomic representation. Unknown values cannot be stored
    /// through the public API, but map to `Uninitialized` regardless.
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Polling,
            3 => Self::Backoff,
            4 => Self::Stopping,
            5 => Self::Stopped,
            6 => Self::ConfigError,
            _ => Self::Uninitialized,
        }
    }

    /// Snake-case name, matching the serialized form.
    pub fn name(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Starting => "starting",
            Self::Polling => "polling",
            Self::Backoff => "backoff",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::ConfigError => "config_error",
        }
    }

    /// True while a worker task is alive or being brought up/down.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Polling | Self::Backoff | Self::Stopping
        )
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Job outcome counters
// ---------------------------------------------------------------------------

/// Terminal (or per-attempt) job outcome categories counted by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobCounter {
    Succeeded,
    /// Left on the queue for redelivery.
    Retried,
    /// Dropped before reaching the engine (malformed message).
    Failed,
    /// Deleted after exhausting its attempts or failing permanently.
    DeadLettered,
}

// ---------------------------------------------------------------------------
// StatusSnapshot
// ---------------------------------------------------------------------------

/// Read-only view of the registry handed to hosts.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state: WorkerState,
    pub last_error: Option<String>,
    /// Seconds since the worker was last started, if it has been.
    pub uptime_secs: Option<u64>,
    pub started_at: Option<Timestamp>,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
}

// ---------------------------------------------------------------------------
// StatusRegistry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct StartMark {
    instant: Instant,
    at: Timestamp,
}

/// Single-writer, many-reader worker status.
#[derive(Debug)]
pub struct StatusRegistry {
    state: AtomicU8,
    last_error: RwLock<Option<String>>,
    started: RwLock<Option<StartMark>>,
    succeeded: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(WorkerState::Uninitialized as u8),
            last_error: RwLock::new(None),
            started: RwLock::new(None),
            succeeded: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
        }
    }

    /// Latest committed state. Lock-free.
    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Commit a new state. Returns the previous one.
    pub fn set_state(&self, new_state: WorkerState) -> WorkerState {
        WorkerState::from_u8(self.state.swap(new_state as u8, Ordering::AcqRel))
    }

    /// Commit `new_state` unless the current state is one of `unless`,
    /// as a single atomic step. `Ok` carries the previous state, `Err`
    /// the state that blocked the transition.
    pub fn set_state_unless(
        &self,
        new_state: WorkerState,
        unless: &[WorkerState],
    ) -> Result<WorkerState, WorkerState> {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (!unless.contains(&WorkerState::from_u8(current))).then_some(new_state as u8)
            })
            .map(WorkerState::from_u8)
            .map_err(WorkerState::from_u8)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn set_last_error(&self, error: impl Into<String>) {
        let error = error.into();
        match self.last_error.write() {
            Ok(mut guard) => *guard = Some(error),
            Err(poisoned) => *poisoned.into_inner() = Some(error),
        }
    }

    pub fn clear_last_error(&self) {
        match self.last_error.write() {
            Ok(mut guard) => *guard = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }

    /// Record the start of a new worker run; uptime is measured from here.
    pub fn mark_started(&self) {
        let mark = StartMark {
            instant: Instant::now(),
            at: Utc::now(),
        };
        match self.started.write() {
            Ok(mut guard) => *guard = Some(mark),
            Err(poisoned) => *poisoned.into_inner() = Some(mark),
        }
    }

    pub fn increment(&self, counter: JobCounter) {
        self.counter(counter).fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self, counter: JobCounter) -> u64 {
        self.counter(counter).load(Ordering::Relaxed)
    }

    /// Point-in-time view of state, last error, uptime and counters.
    pub fn snapshot(&self) -> StatusSnapshot {
        let started = self
            .started
            .read()
            .map(|guard| *guard)
            .unwrap_or_else(|poisoned| *poisoned.into_inner());

        StatusSnapshot {
            state: self.state(),
            last_error: self.last_error(),
            uptime_secs: started.map(|m| m.instant.elapsed().as_secs()),
            started_at: started.map(|m| m.at),
            jobs_succeeded: self.count(JobCounter::Succeeded),
            jobs_retried: self.count(JobCounter::Retried),
            jobs_failed: self.count(JobCounter::Failed),
            jobs_dead_lettered: self.count(JobCounter::DeadLettered),
        }
    }

    fn counter(&self, counter: JobCounter) -> &AtomicU64 {
        match counter {
            JobCounter::Succeeded => &self.succeeded,
            JobCounter::Retried => &self.retried,
            JobCounter::Failed => &self.failed,
            JobCounter::DeadLettered => &self.dead_lettered,
        }
    }
}

impl Default for StatusRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
