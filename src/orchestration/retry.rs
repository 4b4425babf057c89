//! Retry policy for failed task attempts.
//!
//! `RetryPolicy::decide` is a pure function of the failed attempt's index
//! and the failure kind; it never looks at wall-clock time or task identity.

use crate::config::RetryConfig;
use crate::core::record::{Classification, ErrorKind};
use std::collections::BTreeSet;
use std::time::Duration;

/// Default number of retries before giving up on a task.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default multiplier applied per attempt.
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

/// Default upper bound on a single delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Verdict for a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run the task again after `delay`.
    Retry { delay: Duration },
    /// Stop retrying; the task fails terminally.
    GiveUp,
}

impl RetryDecision {
    pub fn is_retry(&self) -> bool {
        matches!(self, RetryDecision::Retry { .. })
    }
}

/// Exponential backoff with a cap, restricted to a set of error kinds.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed after the first run. Attempts are 0-based and a
    /// failed attempt is retried while `attempt < max_attempts`, so
    /// `max_attempts = 3` allows up to 4 runs.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub max_backoff: Duration,
    /// Retryable kinds that are actually retried.
    pub retry_on: BTreeSet<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_backoff: DEFAULT_MAX_BACKOFF,
            retry_on: [ErrorKind::Timeout, ErrorKind::Network, ErrorKind::Transient]
                .into_iter()
                .collect(),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            backoff_factor: config.backoff_factor,
            max_backoff: Duration::from_secs(config.max_backoff_secs),
            retry_on: config.retry_on.iter().copied().collect(),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Decide what to do after attempt number `attempt` (0-based) failed.
    ///
    /// Retries while `attempt < max_attempts` for retryable kinds listed in
    /// `retry_on`. Fatal kinds give up immediately.
    pub fn decide(&self, attempt: u32, kind: ErrorKind) -> RetryDecision {
        if kind.classification() == Classification::Fatal {
            return RetryDecision::GiveUp;
        }
        if !self.retry_on.contains(&kind) || attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry {
            delay: self.delay_for(attempt),
        }
    }

    /// `base_delay * backoff_factor ^ attempt`, capped at `max_backoff`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}
