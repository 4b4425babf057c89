//! Iteration controller.
//!
//! Wraps scheduler passes into iterations and decides, after each one,
//! whether to plan more work, hold for an operator, or stop.
//!
//! Phases: `Planning -> Executing -> Evaluating -> {Planning, Holding, Stopped}`.
//! `Holding` and `Stopped` end the automated loop; a holding run can be
//! resumed once the operator has dealt with the failure.

use crate::core::graph::TaskGraph;
use crate::error::{Error, Result};
use crate::orchestration::collaborators::{ContextProvider, ObjectiveCheck, ObjectiveStatus, Planner};
use crate::orchestration::recovery::RollbackReport;
use crate::orchestration::scheduler::{DrainReport, Scheduler};
use crate::orchestration::summary::{HoldReason, RunContext, RunStatus, RunSummary, StopReason};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Default iteration budget.
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// Controller phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    Executing,
    Evaluating,
    Holding,
    Stopped,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Planning => write!(f, "PLANNING"),
            Phase::Executing => write!(f, "EXECUTING"),
            Phase::Evaluating => write!(f, "EVALUATING"),
            Phase::Holding => write!(f, "HOLDING"),
            Phase::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// A phase entered at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseHistoryEntry {
    pub phase: Phase,
    pub iteration: u32,
    pub entered_at: DateTime<Utc>,
}

/// Drives planning, execution and evaluation until the run stops or holds.
pub struct IterationController {
    run_id: Uuid,
    objective: String,
    planner: Arc<dyn Planner>,
    objective_check: Arc<dyn ObjectiveCheck>,
    context: Arc<dyn ContextProvider>,
    scheduler: Scheduler,
    graph: TaskGraph,
    phase: Phase,
    history: Vec<PhaseHistoryEntry>,
    max_iterations: u32,
    snapshot_path: Option<PathBuf>,
    status: Option<RunStatus>,
    rollbacks: Vec<RollbackReport>,
    last_drain: Option<DrainReport>,
    started_at: DateTime<Utc>,
}

impl IterationController {
    pub fn new(
        objective: &str,
        planner: Arc<dyn Planner>,
        objective_check: Arc<dyn ObjectiveCheck>,
        context: Arc<dyn ContextProvider>,
        scheduler: Scheduler,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            objective: objective.to_string(),
            planner,
            objective_check,
            context,
            scheduler,
            graph: TaskGraph::empty(),
            phase: Phase::Planning,
            history: vec![PhaseHistoryEntry {
                phase: Phase::Planning,
                iteration: 0,
                entered_at: Utc::now(),
            }],
            max_iterations: DEFAULT_MAX_ITERATIONS,
            snapshot_path: None,
            status: None,
            rollbacks: Vec::new(),
            last_drain: None,
            started_at: Utc::now(),
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// Persist the graph as JSON to `path` after every evaluation and when
    /// the loop ends.
    pub fn with_snapshot_path(mut self, path: PathBuf) -> Self {
        self.snapshot_path = Some(path);
        self
    }

    /// Start from an existing graph, e.g. one loaded from a snapshot.
    pub fn with_graph(mut self, graph: TaskGraph) -> Self {
        self.graph = graph;
        self
    }

    /// Start from a graph whose run ended holding, e.g. one reloaded from
    /// its snapshot. The controller waits in `Holding` until
    /// [`resume`](Self::resume) is called.
    pub fn with_held_graph(mut self, graph: TaskGraph) -> Self {
        self.history = vec![PhaseHistoryEntry {
            phase: Phase::Holding,
            iteration: graph.iteration(),
            entered_at: Utc::now(),
        }];
        self.graph = graph;
        self.phase = Phase::Holding;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn history(&self) -> &[PhaseHistoryEntry] {
        &self.history
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn status(&self) -> Option<&RunStatus> {
        self.status.as_ref()
    }

    pub fn can_transition(&self, target: Phase) -> bool {
        matches!(
            (self.phase, target),
            (Phase::Planning, Phase::Executing)
                | (Phase::Planning, Phase::Holding)
                | (Phase::Executing, Phase::Evaluating)
                | (Phase::Executing, Phase::Holding)
                | (Phase::Evaluating, Phase::Planning)
                | (Phase::Evaluating, Phase::Holding)
                | (Phase::Evaluating, Phase::Stopped)
                | (Phase::Holding, Phase::Executing)
        )
    }

    fn transition(&mut self, target: Phase) -> Result<()> {
        if !self.can_transition(target) {
            return Err(Error::InvalidPhaseTransition {
                from: self.phase.to_string(),
                to: target.to_string(),
            });
        }
        info!(from = %self.phase, to = %target, iteration = self.graph.iteration(), "Phase transition");
        self.phase = target;
        self.history.push(PhaseHistoryEntry {
            phase: target,
            iteration: self.graph.iteration(),
            entered_at: Utc::now(),
        });
        Ok(())
    }

    fn hold(&mut self, reason: HoldReason) -> Result<()> {
        warn!(%reason, "Run holding");
        self.transition(Phase::Holding)?;
        self.status = Some(RunStatus::Holding(reason));
        Ok(())
    }

    fn stop(&mut self, reason: StopReason) -> Result<()> {
        self.transition(Phase::Stopped)?;
        self.status = Some(RunStatus::Stopped(reason));
        Ok(())
    }

    /// Run the loop until it stops or holds.
    ///
    /// # Errors
    /// Contract violations only (invalid transitions, cycles); task failures
    /// end the loop in `Holding`.
    pub async fn run(&mut self) -> Result<RunSummary> {
        loop {
            match self.phase {
                Phase::Planning => self.plan().await?,
                Phase::Executing => self.execute().await?,
                Phase::Evaluating => self.evaluate().await?,
                Phase::Holding | Phase::Stopped => break,
            }
        }
        self.persist();
        Ok(self.summary())
    }

    /// Clear terminal failures and continue a holding run from `Executing`.
    pub async fn resume(&mut self) -> Result<RunSummary> {
        if self.phase != Phase::Holding {
            return Err(Error::InvalidPhaseTransition {
                from: self.phase.to_string(),
                to: Phase::Executing.to_string(),
            });
        }
        for id in self.graph.with_status(crate::core::TaskStatus::Failed) {
            self.graph.clear_failure(&id)?;
        }
        self.scheduler.renew_cancellation();
        self.status = None;
        self.transition(Phase::Executing)?;
        info!(run = %self.run_id, "Run resumed by operator");
        self.run().await
    }

    async fn plan(&mut self) -> Result<()> {
        let iteration = self.graph.begin_iteration();
        let context = self.context.planning_context().await;

        let planned = if self.graph.is_empty() {
            info!(iteration, objective = %self.objective, "Splitting objective");
            self.planner.split_objective(&self.objective, &context).await
        } else {
            info!(iteration, "Refining plan");
            self.planner.refine(&self.graph.snapshot(), &context).await
        };

        let merged = planned.and_then(|tasks| self.graph.merge(tasks));
        match merged {
            Ok(added) => {
                info!(iteration, added, "Planning finished");
                self.transition(Phase::Executing)
            }
            Err(e) if e.is_contract_violation() => Err(e),
            Err(e) => {
                error!(error = %e, "Planning failed");
                self.hold(HoldReason::PlanningFailed(e.to_string()))
            }
        }
    }

    async fn execute(&mut self) -> Result<()> {
        match self.scheduler.drain(&mut self.graph).await {
            Ok(report) => {
                self.rollbacks.extend(report.rollbacks.iter().cloned());
                self.last_drain = Some(report);
                self.transition(Phase::Evaluating)
            }
            Err(Error::CheckpointRestore { checkpoint, reason }) => {
                error!(%checkpoint, %reason, "Rollback failed");
                self.hold(HoldReason::RollbackFailed(format!("{}: {}", checkpoint, reason)))
            }
            Err(e) => Err(e),
        }
    }

    async fn evaluate(&mut self) -> Result<()> {
        let cancelled = self.last_drain.as_ref().is_some_and(|r| r.cancelled);
        let counts = self.graph.counts();

        if cancelled {
            return self.hold(HoldReason::Cancelled);
        }
        if counts.failed > 0 {
            return self.hold(HoldReason::TaskFailures);
        }
        if self.graph.is_stuck() {
            return self.hold(HoldReason::Unsatisfiable);
        }

        self.persist();
        let status = self
            .objective_check
            .evaluate(&self.graph.snapshot(), &self.objective)
            .await;

        match status {
            Ok(ObjectiveStatus::Met) => {
                info!(iteration = self.graph.iteration(), "Objective met");
                self.stop(StopReason::ObjectiveMet)
            }
            Ok(ObjectiveStatus::NeedsOperator(reason)) => {
                self.hold(HoldReason::NeedsOperator(reason))
            }
            Ok(ObjectiveStatus::Unmet) if self.graph.iteration() >= self.max_iterations => {
                warn!(max_iterations = self.max_iterations, "Iteration budget exhausted");
                self.stop(StopReason::BudgetExhausted)
            }
            Ok(ObjectiveStatus::Unmet) => self.transition(Phase::Planning),
            Err(e) => self.hold(HoldReason::NeedsOperator(format!(
                "objective check failed: {}",
                e
            ))),
        }
    }

    fn persist(&self) {
        let Some(path) = &self.snapshot_path else {
            return;
        };
        if let Err(e) = self.graph.snapshot().save(path) {
            warn!(path = %path.display(), error = %e, "Failed to persist graph snapshot");
        }
    }

    /// Snapshot of the run for the operator layer.
    pub fn summary(&self) -> RunSummary {
        let status = self
            .status
            .clone()
            .unwrap_or(RunStatus::Holding(HoldReason::Cancelled));
        RunSummary::build(
            status,
            &self.graph,
            RunContext {
                run_id: self.run_id,
                objective: &self.objective,
                started_at: self.started_at,
                records: self.scheduler.records(),
                rollbacks: &self.rollbacks,
                recovery: self.scheduler.recovery(),
            },
        )
    }
}

impl std::fmt::Debug for IterationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IterationController")
            .field("run_id", &self.run_id)
            .field("phase", &self.phase)
            .field("graph", &self.graph)
            .finish()
    }
}
