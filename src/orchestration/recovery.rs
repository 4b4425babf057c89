//! Per-task failure handling.
//!
//! The recovery manager combines the retry policy with the checkpoint stack.
//! A failed attempt is either retried after a delay or fails terminally;
//! with auto-rollback on, a terminal failure also queues a rollback to the
//! checkpoint taken before the task's first attempt. The scheduler performs
//! queued rollbacks once no attempt is in flight.

use crate::core::graph::TaskGraph;
use crate::core::record::{ErrorKind, ExecutionRecord};
use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::Result;
use crate::orchestration::checkpoint::{Checkpoint, CheckpointStore};
use crate::orchestration::retry::{RetryDecision, RetryPolicy};
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{info, warn};

/// What happens to a task after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryVerdict {
    /// Back to `Ready`; dispatch again after `delay`.
    Retry { delay: Duration },
    /// Terminal failure. `rollback_queued` is set when a rollback to the
    /// task's checkpoint will run once in-flight work settles.
    Failed { rollback_queued: bool },
}

/// Outcome of a completed rollback.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollbackReport {
    /// Failed tasks whose checkpoint triggered the rollback.
    pub triggered_by: Vec<TaskId>,
    pub checkpoint: String,
    /// Tasks reset to `Pending`.
    pub reset: Vec<TaskId>,
}

/// Retry policy plus checkpoint stack plus the auto-rollback switch.
#[derive(Debug)]
pub struct ErrorRecoveryManager {
    policy: RetryPolicy,
    checkpoints: Option<CheckpointStore>,
    auto_rollback: bool,
    pending_rollback: BTreeSet<TaskId>,
    rolled_back: BTreeSet<TaskId>,
}

impl ErrorRecoveryManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            checkpoints: None,
            auto_rollback: false,
            pending_rollback: BTreeSet::new(),
            rolled_back: BTreeSet::new(),
        }
    }

    pub fn with_checkpoints(mut self, store: CheckpointStore) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn with_auto_rollback(mut self, enabled: bool) -> Self {
        self.auto_rollback = enabled;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn auto_rollback(&self) -> bool {
        self.auto_rollback
    }

    /// Take a checkpoint before `task` runs, if this is its first attempt.
    ///
    /// `position` is the number of execution records written so far.
    /// Backend failures are logged and the task runs without a checkpoint.
    pub async fn checkpoint_before(&mut self, task: &Task, position: usize) {
        if task.attempt != 0 {
            return;
        }
        let Some(store) = self.checkpoints.as_mut() else {
            return;
        };
        if let Err(e) = store.create(&task.id, task.attempt, position).await {
            warn!(task = %task.id, error = %e, "Checkpoint creation failed, continuing without one");
        }
    }

    /// Decide the fate of a failed attempt of `task`.
    ///
    /// `task.attempt` is the index of the attempt that just failed.
    pub fn handle_failure(&mut self, task: &Task, kind: ErrorKind) -> RecoveryVerdict {
        match self.policy.decide(task.attempt, kind) {
            RetryDecision::Retry { delay } => {
                info!(task = %task.id, attempt = task.attempt, %kind, ?delay, "Retrying task");
                RecoveryVerdict::Retry { delay }
            }
            RetryDecision::GiveUp => {
                let rollback_queued = self.auto_rollback && self.has_checkpoint(&task.id);
                if rollback_queued {
                    self.pending_rollback.insert(task.id.clone());
                } else if self.auto_rollback {
                    warn!(task = %task.id, "No checkpoint retained, cannot roll back");
                }
                warn!(task = %task.id, attempt = task.attempt, %kind, rollback_queued, "Task failed");
                RecoveryVerdict::Failed { rollback_queued }
            }
        }
    }

    pub fn has_pending_rollback(&self) -> bool {
        !self.pending_rollback.is_empty()
    }

    pub fn has_checkpoint(&self, task: &TaskId) -> bool {
        self.checkpoints
            .as_ref()
            .is_some_and(|store| store.has_checkpoint(task))
    }

    /// Whether `task` was already rolled back in this run.
    pub fn was_rolled_back(&self, task: &TaskId) -> bool {
        self.rolled_back.contains(task)
    }

    /// Run the queued rollback.
    ///
    /// Restores the earliest checkpoint among the queued failures, then
    /// resets every non-failed task with a record at or after that
    /// checkpoint's position back to `Pending`. Must be called with no task
    /// running; the backend restore runs inline on the control loop.
    ///
    /// # Errors
    /// `CheckpointRestore` if the backend cannot restore; nothing in the
    /// graph is touched in that case.
    pub fn perform_rollback(
        &mut self,
        graph: &mut TaskGraph,
        records: &[ExecutionRecord],
    ) -> Result<Option<RollbackReport>> {
        let Some(store) = self.checkpoints.as_mut() else {
            self.pending_rollback.clear();
            return Ok(None);
        };
        if self.pending_rollback.is_empty() {
            return Ok(None);
        }

        let triggered_by: Vec<TaskId> = std::mem::take(&mut self.pending_rollback)
            .into_iter()
            .collect();
        let target = triggered_by
            .iter()
            .filter_map(|id| store.latest_for(id).map(|cp| (cp.position, id.clone())))
            .min_by_key(|(position, _)| *position)
            .map(|(_, id)| id);
        let Some(target) = target else {
            warn!("Queued rollback has no retained checkpoint");
            return Ok(None);
        };

        let checkpoint: Checkpoint = store.restore_to(&target)?;

        let mut reset = Vec::new();
        let later: BTreeSet<&TaskId> = records
            .iter()
            .skip(checkpoint.position)
            .map(|r| &r.task_id)
            .collect();
        for id in later {
            let resettable = graph.get(id).is_some_and(|t| {
                matches!(
                    t.status,
                    TaskStatus::Completed | TaskStatus::Ready | TaskStatus::Pending
                )
            });
            if resettable {
                graph.reset_pending(id)?;
                reset.push(id.clone());
            }
        }

        self.rolled_back.extend(triggered_by.iter().cloned());
        info!(
            checkpoint = %checkpoint.label,
            reset = reset.len(),
            "Rolled back to checkpoint"
        );
        Ok(Some(RollbackReport {
            triggered_by,
            checkpoint: checkpoint.label,
            reset,
        }))
    }
}
