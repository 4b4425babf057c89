//! Interfaces to the systems the orchestrator drives but does not own.
//!
//! The planner produces tasks, the executor runs them, the context provider
//! supplies opaque text for both, and the objective check decides whether
//! the run is done. All of them are black boxes behind these traits.

use crate::core::graph::GraphSnapshot;
use crate::core::record::ExecutionOutcome;
use crate::core::task::Task;
use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;

/// Produces task sets from an objective.
///
/// Returned tasks may only depend on ids already in the graph or on each
/// other; anything else is rejected when merged.
#[async_trait]
pub trait Planner: Send + Sync {
    /// Initial task set for `objective`.
    async fn split_objective(&self, objective: &str, context: &str) -> Result<Vec<Task>>;

    /// Additional tasks given the current state of the run.
    async fn refine(&self, snapshot: &GraphSnapshot, context: &str) -> Result<Vec<Task>>;
}

/// Runs a single task attempt.
///
/// Failures are values, not errors: every failure carries an
/// [`ErrorKind`](crate::core::ErrorKind) so recovery can classify it.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn run(&self, task: &Task, context: &str) -> ExecutionOutcome;
}

/// Supplies opaque context text. The orchestrator never inspects it.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    /// Context handed to the executor for `task`.
    async fn relevant_context(&self, task: &Task) -> String;

    /// Context handed to the planner.
    async fn planning_context(&self) -> String {
        String::new()
    }
}

/// Result of an objective check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum ObjectiveStatus {
    /// The objective is reached; the run stops successfully.
    Met,
    /// More work is needed; plan another iteration if budget allows.
    Unmet,
    /// The check cannot decide without a human.
    NeedsOperator(String),
}

/// Decides whether the objective has been reached.
#[async_trait]
pub trait ObjectiveCheck: Send + Sync {
    async fn evaluate(&self, snapshot: &GraphSnapshot, objective: &str) -> Result<ObjectiveStatus>;
}

/// Context provider that supplies nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoContext;

#[async_trait]
impl ContextProvider for NoContext {
    async fn relevant_context(&self, _task: &Task) -> String {
        String::new()
    }
}
