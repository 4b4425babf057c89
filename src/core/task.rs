//! Task data model for the dependency graph.
//!
//! Tasks are the atomic units of work handed to the external executor. Each
//! task tracks its dependencies, the resource scope it is expected to touch,
//! its lifecycle status, how many attempts it has consumed, and the outcome
//! of the last attempt.

use crate::core::record::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Default component label for tasks that do not declare one.
pub const DEFAULT_COMPONENT: &str = "general";

/// Identifier of a task, unique within an orchestration run.
///
/// Ids are chosen by the planner and stay stable across iterations, so the
/// ordering of ids is what makes scheduling reproducible.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

/// Task status in its lifecycle.
///
/// Transitions are owned by the [`TaskGraph`](crate::core::TaskGraph);
/// the only legal paths are
/// `Pending -> Ready -> Running -> {Completed, Failed, Ready (retry)}`
/// plus the rollback and operator paths back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, dependencies not yet satisfied.
    #[default]
    Pending,
    /// Dependencies satisfied, waiting for dispatch (or for a retry).
    Ready,
    /// An attempt is in flight.
    Running,
    /// Finished successfully.
    Completed,
    /// Terminally failed.
    Failed,
    /// Set aside by an operator; never dispatched.
    Blocked,
}

impl TaskStatus {
    /// Whether no further automatic transition will happen.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Blocked
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Ready => write!(f, "ready"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Blocked => write!(f, "blocked"),
        }
    }
}

/// Outcome of the most recent attempt of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum TaskResult {
    /// The executor reported success.
    Success {
        /// Executor output (typically stdout of the agent).
        output: String,
    },
    /// The executor reported a failure.
    Failure {
        /// Classification of the failure.
        kind: ErrorKind,
        /// Error detail as reported by the executor.
        detail: String,
    },
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskResult::Success { .. })
    }
}

/// A single task in the dependency graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Opaque instruction text passed to the executor.
    pub description: String,
    /// Name of the execution profile that runs this task.
    pub assignee: String,
    /// Tasks that must be completed before this one may start.
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    /// Path patterns this task is expected to modify.
    #[serde(default)]
    pub resource_scope: BTreeSet<String>,
    /// Component label used to pick relevant project context.
    #[serde(default = "default_component")]
    pub component: String,
    #[serde(default)]
    pub status: TaskStatus,
    /// Index of the current attempt; 0 until the first retry.
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub result: Option<TaskResult>,
    /// Iteration in which the planner created this task.
    #[serde(default)]
    pub iteration: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

fn default_component() -> String {
    DEFAULT_COMPONENT.to_string()
}

impl Task {
    /// Create a new pending task with no dependencies and an empty scope.
    pub fn new(id: impl Into<TaskId>, description: &str, assignee: &str) -> Self {
        Self {
            id: id.into(),
            description: description.to_string(),
            assignee: assignee.to_string(),
            dependencies: BTreeSet::new(),
            resource_scope: BTreeSet::new(),
            component: default_component(),
            status: TaskStatus::Pending,
            attempt: 0,
            result: None,
            iteration: 0,
            started_at: None,
            completed_at: None,
        }
    }

    /// Builder: add dependencies.
    pub fn depends_on<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Builder: add resource scope patterns.
    pub fn with_scope<I, S>(mut self, scope: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resource_scope.extend(scope.into_iter().map(Into::into));
        self
    }

    /// Builder: set the component label.
    pub fn with_component(mut self, component: &str) -> Self {
        self.component = component.to_string();
        self
    }

    /// Whether the task is in a terminal state.
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the task may be dispatched once its dependencies allow it.
    pub fn can_start(&self) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::Ready)
    }

    /// Error kind of the last failed attempt, if any.
    pub fn failure_kind(&self) -> Option<ErrorKind> {
        match &self.result {
            Some(TaskResult::Failure { kind, .. }) => Some(*kind),
            _ => None,
        }
    }
}
