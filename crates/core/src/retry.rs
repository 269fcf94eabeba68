//! Exponential backoff with multiplicative jitter.
//!
//! [`RetryPolicy`] is the immutable configuration: base and max delay,
//! the per-job attempt budget, and the jitter fraction. [`Backoff`]
//! tracks one unbroken failure streak and hands out the next delay.
//!
//! Delays follow `min(max_delay, base_delay * 2^attempt)`, then a
//! random factor in `[1 - jitter, 1 + jitter]` is applied and the
//! result is clamped back into `[0, max_delay]`.

use std::time::Duration;

use rand::Rng;
use serde::Serialize;

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default upper bound on any single delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Default number of processing attempts per job before it is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default jitter fraction (+/- 20%).
pub const DEFAULT_JITTER_FRACTION: f64 = 0.2;

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Immutable retry configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
    jitter_fraction: f64,
}

impl RetryPolicy {
    /// Build a policy, rejecting inconsistent values.
    ///
    /// - `base_delay` must not exceed `max_delay`.
    /// - `max_attempts` must be at least 1.
    /// - `jitter_fraction` must be a finite value in `0.0..=1.0`.
    pub fn new(
        base_delay: Duration,
        max_delay: Duration,
        max_attempts: u32,
        jitter_fraction: f64,
    ) -> Result<Self, CoreError> {
        if base_delay > max_delay {
            return Err(CoreError::Validation(format!(
                "base delay ({base_delay:?}) must not exceed max delay ({max_delay:?})"
            )));
        }
        if max_attempts == 0 {
            return Err(CoreError::Validation(
                "max attempts must be at least 1".into(),
            ));
        }
        if !jitter_fraction.is_finite() || !(0.0..=1.0).contains(&jitter_fraction) {
            return Err(CoreError::Validation(format!(
                "jitter fraction must be within 0.0..=1.0, got {jitter_fraction}"
            )));
        }
        Ok(Self {
            base_delay,
            max_delay,
            max_attempts,
            jitter_fraction,
        })
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn jitter_fraction(&self) -> f64 {
        self.jitter_fraction
    }

    /// Un-jittered delay for `attempt` (zero-based): `min(max, base * 2^attempt)`.
    ///
    /// Saturates instead of overflowing, so any `u32` attempt is safe.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Jittered delay for `attempt`, drawing the jitter factor from `rng`.
    ///
    /// Always within `[0, max_delay]`.
    pub fn delay_for<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay_for(attempt);
        if self.jitter_fraction == 0.0 {
            return base;
        }

        let factor =
            rng.random_range((1.0 - self.jitter_fraction)..=(1.0 + self.jitter_fraction));
        let secs = (base.as_secs_f64() * factor).clamp(0.0, self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay)
    }

    /// Jittered delay for `attempt` using the thread-local RNG.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        self.delay_for(attempt, &mut rand::rng())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            jitter_fraction: DEFAULT_JITTER_FRACTION,
        }
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Failure-streak counter driving a [`RetryPolicy`].
///
/// The attempt counter is monotonic within one streak and goes back to
/// zero on [`reset`](Self::reset), which callers invoke after any success.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Number of consecutive failures recorded in the current streak.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Delay for the current attempt; advances the streak.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.policy.jittered_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// End the streak.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
