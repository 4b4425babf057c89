//! Read-only run summary handed to the operator layer.

use crate::core::graph::{TaskGraph, Unsatisfiable};
use crate::core::record::{ErrorKind, ExecutionRecord};
use crate::core::task::{TaskId, TaskResult, TaskStatus};
use crate::orchestration::recovery::{ErrorRecoveryManager, RollbackReport};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Why the automated loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    ObjectiveMet,
    BudgetExhausted,
}

/// Why the run is waiting for an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum HoldReason {
    /// At least one task failed terminally.
    TaskFailures,
    /// Pending tasks depend on a failed or blocked task.
    Unsatisfiable,
    /// Restoring a checkpoint failed.
    RollbackFailed(String),
    /// The planner failed or returned an invalid task set.
    PlanningFailed(String),
    /// The objective check asked for a human decision.
    NeedsOperator(String),
    /// The run was cancelled before the graph drained.
    Cancelled,
}

impl std::fmt::Display for HoldReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HoldReason::TaskFailures => write!(f, "task failures"),
            HoldReason::Unsatisfiable => write!(f, "unsatisfiable dependencies"),
            HoldReason::RollbackFailed(reason) => write!(f, "rollback failed: {}", reason),
            HoldReason::PlanningFailed(reason) => write!(f, "planning failed: {}", reason),
            HoldReason::NeedsOperator(reason) => write!(f, "needs operator: {}", reason),
            HoldReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Final status of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum RunStatus {
    Stopped(StopReason),
    /// Resumable once an operator clears the cause.
    Holding(HoldReason),
}

impl RunStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Stopped(StopReason::ObjectiveMet))
    }

    pub fn is_holding(&self) -> bool {
        matches!(self, RunStatus::Holding(_))
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Stopped(StopReason::ObjectiveMet) => write!(f, "STOPPED (objective met)"),
            RunStatus::Stopped(StopReason::BudgetExhausted) => {
                write!(f, "STOPPED (iteration budget exhausted)")
            }
            RunStatus::Holding(reason) => write!(f, "HOLDING ({})", reason),
        }
    }
}

/// A terminally failed task as reported to the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureReport {
    pub task: TaskId,
    pub kind: Option<ErrorKind>,
    pub detail: String,
    /// Attempts consumed, including the last one.
    pub attempts: u32,
    /// A checkpoint from before the task's first attempt is retained.
    pub checkpoint_available: bool,
    pub rolled_back: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub objective: String,
    pub status: RunStatus,
    pub iterations: u32,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
    pub failures: Vec<FailureReport>,
    pub unsatisfiable: Vec<Unsatisfiable>,
    pub rollbacks: Vec<RollbackReport>,
    pub records: Vec<ExecutionRecord>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Inputs for [`RunSummary::build`] that are not part of the graph.
pub struct RunContext<'a> {
    pub run_id: Uuid,
    pub objective: &'a str,
    pub started_at: DateTime<Utc>,
    pub records: &'a [ExecutionRecord],
    pub rollbacks: &'a [RollbackReport],
    pub recovery: &'a ErrorRecoveryManager,
}

impl RunSummary {
    pub fn build(status: RunStatus, graph: &TaskGraph, ctx: RunContext<'_>) -> Self {
        let counts = graph.counts();
        let failures = graph
            .tasks()
            .filter(|t| t.status == TaskStatus::Failed)
            .map(|t| {
                let detail = match &t.result {
                    Some(TaskResult::Failure { detail, .. }) => detail.clone(),
                    _ => String::new(),
                };
                FailureReport {
                    task: t.id.clone(),
                    kind: t.failure_kind(),
                    detail,
                    attempts: t.attempt + 1,
                    checkpoint_available: ctx.recovery.has_checkpoint(&t.id),
                    rolled_back: ctx.recovery.was_rolled_back(&t.id),
                }
            })
            .collect();

        Self {
            run_id: ctx.run_id,
            objective: ctx.objective.to_string(),
            status,
            iterations: graph.iteration(),
            total: counts.total(),
            completed: counts.completed,
            failed: counts.failed,
            pending: counts.pending + counts.ready,
            failures,
            unsatisfiable: graph.unsatisfiable(),
            rollbacks: ctx.rollbacks.to_vec(),
            records: ctx.records.to_vec(),
            started_at: ctx.started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn is_holding(&self) -> bool {
        self.status.is_holding()
    }
}
