//! Execution outcomes and per-attempt records.
//!
//! An [`ExecutionRecord`] is written once per attempt and never modified.
//! Failures carry an [`ErrorKind`], whose [`Classification`] decides
//! whether the attempt may be retried.

use crate::core::task::TaskId;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static TIMEOUT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(timed? ?out|timeout|deadline exceeded)\b").expect("valid regex")
});

static NETWORK_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(connection|network|unreachable|dns|econnreset|econnrefused|rate.?limit|too many requests|\b429\b|\b50[234]\b)",
    )
    .expect("valid regex")
});

static ABORT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(abort(ed)?|cancel(l)?ed|interrupted)\b").expect("valid regex"));

static VALIDATION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(validation|invalid|permission denied|unauthori[sz]ed|forbidden|not found|unknown profile|syntax error)",
    )
    .expect("valid regex")
});

/// Kind of an execution failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The attempt exceeded its wall-clock budget.
    Timeout,
    /// Connectivity problem between the executor and its backend.
    Network,
    /// Any other transient executor error.
    Transient,
    /// The task or its inputs were rejected.
    Validation,
    /// The executor signalled an explicit abort.
    Aborted,
    /// A prerequisite the task relies on is missing.
    Dependency,
}

/// Whether a failure may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Retryable,
    Fatal,
}

impl ErrorKind {
    pub fn classification(&self) -> Classification {
        match self {
            ErrorKind::Timeout | ErrorKind::Network | ErrorKind::Transient => {
                Classification::Retryable
            }
            ErrorKind::Validation | ErrorKind::Aborted | ErrorKind::Dependency => {
                Classification::Fatal
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.classification() == Classification::Retryable
    }

    /// Classify a free-form error detail.
    ///
    /// Pure function of the text. Unrecognised errors are `Transient`.
    pub fn classify(detail: &str) -> Self {
        if TIMEOUT_PATTERN.is_match(detail) {
            ErrorKind::Timeout
        } else if ABORT_PATTERN.is_match(detail) {
            ErrorKind::Aborted
        } else if VALIDATION_PATTERN.is_match(detail) {
            ErrorKind::Validation
        } else if NETWORK_PATTERN.is_match(detail) {
            ErrorKind::Network
        } else {
            ErrorKind::Transient
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Network => "network",
            ErrorKind::Transient => "transient",
            ErrorKind::Validation => "validation",
            ErrorKind::Aborted => "aborted",
            ErrorKind::Dependency => "dependency",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "timeout" => Ok(ErrorKind::Timeout),
            "network" => Ok(ErrorKind::Network),
            "transient" | "temporary" => Ok(ErrorKind::Transient),
            "validation" => Ok(ErrorKind::Validation),
            "aborted" | "abort" => Ok(ErrorKind::Aborted),
            "dependency" => Ok(ErrorKind::Dependency),
            other => Err(format!("unknown error kind '{}'", other)),
        }
    }
}

/// What the executor reports for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Success { output: String },
    Failure { kind: ErrorKind, detail: String },
}

impl ExecutionOutcome {
    /// Failure whose kind is derived from the detail text.
    pub fn failure(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        ExecutionOutcome::Failure {
            kind: ErrorKind::classify(&detail),
            detail,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success { .. })
    }
}

/// Immutable record of a single attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub task_id: TaskId,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    /// Set when the attempt failed.
    pub error: Option<ErrorKind>,
    /// Executor output on success, error detail on failure.
    pub output: String,
}

impl ExecutionRecord {
    pub fn new(
        task_id: TaskId,
        attempt: u32,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        outcome: &ExecutionOutcome,
    ) -> Self {
        let (success, error, output) = match outcome {
            ExecutionOutcome::Success { output } => (true, None, output.clone()),
            ExecutionOutcome::Failure { kind, detail } => (false, Some(*kind), detail.clone()),
        };
        Self {
            task_id,
            attempt,
            started_at,
            finished_at,
            success,
            error,
            output,
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}
