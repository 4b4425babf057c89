//! Scheduler for parallel task execution.
//!
//! The scheduler drains a [`TaskGraph`]: it repeatedly promotes tasks whose
//! dependencies completed to `Ready`, takes the ready set, claims resource
//! scopes, and dispatches attempts to the executor, never running more than
//! `max_parallel` at once. Attempts run as tokio tasks in
//! a `JoinSet`, which doubles as the completion queue. Only the drain loop
//! mutates the graph, the resource lock, and the checkpoint stack.
//!
//! Failed attempts go through the [`ErrorRecoveryManager`]. Retry delays are
//! kept by the loop itself, so a task waiting to be retried holds neither a
//! worker slot nor a resource claim.

use crate::config::ExecutionConfig;
use crate::core::graph::{StatusCounts, TaskGraph};
use crate::core::record::{ErrorKind, ExecutionOutcome, ExecutionRecord};
use crate::core::task::{TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::collaborators::{ContextProvider, Executor};
use crate::orchestration::lock::ResourceLock;
use crate::orchestration::recovery::{ErrorRecoveryManager, RecoveryVerdict, RollbackReport};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default number of attempts in flight at once.
pub const DEFAULT_MAX_PARALLEL: usize = 3;

/// Default wall-clock budget per attempt.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(300);

/// Events emitted by the scheduler for task lifecycle changes.
///
/// These let a progress display follow the run without polling the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// An attempt was dispatched.
    TaskStarted { task_id: TaskId, attempt: u32 },
    /// An attempt succeeded.
    TaskCompleted { task_id: TaskId, attempt: u32 },
    /// An attempt failed and will be retried after `delay`.
    TaskRetrying {
        task_id: TaskId,
        attempt: u32,
        kind: ErrorKind,
        delay: Duration,
    },
    /// The task failed terminally.
    TaskFailed {
        task_id: TaskId,
        kind: ErrorKind,
        detail: String,
    },
    /// The workspace was restored to a checkpoint.
    RolledBack {
        checkpoint: String,
        reset: Vec<TaskId>,
    },
    /// The drain pass ended.
    Drained { completed: usize, failed: usize },
}

/// Scheduler limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub max_parallel: usize,
    pub task_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel: DEFAULT_MAX_PARALLEL,
            task_timeout: DEFAULT_TASK_TIMEOUT,
        }
    }
}

impl From<&ExecutionConfig> for SchedulerConfig {
    fn from(config: &ExecutionConfig) -> Self {
        Self {
            max_parallel: config.max_parallel.max(1),
            task_timeout: Duration::from_secs(config.task_timeout_secs),
        }
    }
}

/// What one drain pass did.
#[derive(Debug, Clone, Default)]
pub struct DrainReport {
    /// Records written during this pass, in completion order.
    pub records: Vec<ExecutionRecord>,
    pub rollbacks: Vec<RollbackReport>,
    /// Cancellation was requested; the graph is only partially drained.
    pub cancelled: bool,
    /// Dispatch stopped after a rollback.
    pub halted: bool,
    /// Pending work remains that can never start.
    pub stuck: bool,
    pub counts: StatusCounts,
}

/// Outcome of one attempt as reported by a worker.
struct Attempt {
    task_id: TaskId,
    attempt: u32,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    outcome: ExecutionOutcome,
}

enum Wake {
    Joined(Option<std::result::Result<(tokio::task::Id, Attempt), JoinError>>),
    RetryDue,
    Cancelled,
    Idle,
}

/// Drives task graphs to completion with bounded parallelism.
pub struct Scheduler {
    executor: Arc<dyn Executor>,
    context: Arc<dyn ContextProvider>,
    config: SchedulerConfig,
    lock: ResourceLock,
    recovery: ErrorRecoveryManager,
    cancel: CancellationToken,
    event_tx: Option<mpsc::Sender<SchedulerEvent>>,
    /// Every record of the run; checkpoint positions index into this.
    records: Vec<ExecutionRecord>,
}

impl Scheduler {
    pub fn new(
        executor: Arc<dyn Executor>,
        context: Arc<dyn ContextProvider>,
        config: SchedulerConfig,
        recovery: ErrorRecoveryManager,
    ) -> Self {
        Self {
            executor,
            context,
            config,
            lock: ResourceLock::new(),
            recovery,
            cancel: CancellationToken::new(),
            event_tx: None,
            records: Vec::new(),
        }
    }

    /// Emit [`SchedulerEvent`]s on `tx`. Events are dropped when the
    /// channel is full.
    pub fn with_events(mut self, tx: mpsc::Sender<SchedulerEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that stops further dispatch when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Replace a cancelled token so a resumed run can dispatch again.
    pub fn renew_cancellation(&mut self) -> CancellationToken {
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
        self.cancel.clone()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn recovery(&self) -> &ErrorRecoveryManager {
        &self.recovery
    }

    /// All execution records of the run so far.
    pub fn records(&self) -> &[ExecutionRecord] {
        &self.records
    }

    pub fn lock(&self) -> &ResourceLock {
        &self.lock
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.event_tx {
            if let Err(e) = tx.try_send(event) {
                debug!(error = %e, "Scheduler event dropped");
            }
        }
    }

    /// Run one drain pass over `graph`.
    ///
    /// Returns when nothing is running and nothing more can be dispatched:
    /// the graph is drained, stuck, halted by a rollback, or cancelled.
    ///
    /// # Errors
    /// Only contract violations: an invalid status transition or a failed
    /// checkpoint restore.
    pub async fn drain(&mut self, graph: &mut TaskGraph) -> Result<DrainReport> {
        let mut in_flight: JoinSet<Attempt> = JoinSet::new();
        let mut running: HashMap<tokio::task::Id, TaskId> = HashMap::new();
        let mut retry_at: HashMap<TaskId, Instant> = HashMap::new();
        let mut rollbacks = Vec::new();
        let mut halted = false;
        let first_record = self.records.len();
        let cancel = self.cancel.clone();

        info!(
            tasks = graph.len(),
            max_parallel = self.config.max_parallel,
            "Drain pass started"
        );

        loop {
            let now = Instant::now();
            retry_at.retain(|_, at| *at > now);

            if in_flight.is_empty() && self.recovery.has_pending_rollback() {
                if let Some(report) = self.recovery.perform_rollback(graph, &self.records)? {
                    for id in &report.reset {
                        retry_at.remove(id);
                    }
                    self.emit(SchedulerEvent::RolledBack {
                        checkpoint: report.checkpoint.clone(),
                        reset: report.reset.clone(),
                    });
                    rollbacks.push(report);
                }
                halted = true;
            }
            let promoted = graph.refresh_ready()?;
            if promoted > 0 {
                debug!(promoted, "Tasks became ready");
            }

            let accepting =
                !cancel.is_cancelled() && !halted && !self.recovery.has_pending_rollback();
            if accepting {
                self.dispatch(graph, &mut in_flight, &mut running, &retry_at)
                    .await?;
            }

            let next_retry = if accepting {
                next_retry(graph, &retry_at)
            } else {
                None
            };
            if in_flight.is_empty() && next_retry.is_none() {
                if self.recovery.has_pending_rollback() {
                    continue;
                }
                break;
            }

            let deadline = next_retry.unwrap_or_else(|| now + Duration::from_secs(3600));
            let wake = tokio::select! {
                joined = in_flight.join_next_with_id(), if !in_flight.is_empty() => Wake::Joined(joined),
                _ = tokio::time::sleep_until(deadline), if next_retry.is_some() => Wake::RetryDue,
                _ = cancel.cancelled(), if accepting => Wake::Cancelled,
                else => Wake::Idle,
            };

            match wake {
                Wake::Joined(Some(Ok((id, attempt)))) => {
                    running.remove(&id);
                    self.settle(graph, attempt, &mut retry_at)?;
                }
                Wake::Joined(Some(Err(join_error))) => {
                    let attempt = self.lost_attempt(graph, &mut running, join_error)?;
                    self.settle(graph, attempt, &mut retry_at)?;
                }
                Wake::Cancelled => {
                    info!(in_flight = in_flight.len(), "Cancellation requested, finishing in-flight attempts");
                }
                Wake::Joined(None) | Wake::RetryDue | Wake::Idle => {}
            }
        }

        let counts = graph.counts();
        let report = DrainReport {
            records: self.records[first_record..].to_vec(),
            rollbacks,
            cancelled: cancel.is_cancelled(),
            halted,
            stuck: graph.is_stuck(),
            counts,
        };
        self.emit(SchedulerEvent::Drained {
            completed: counts.completed,
            failed: counts.failed,
        });
        info!(
            completed = counts.completed,
            failed = counts.failed,
            pending = counts.pending,
            cancelled = report.cancelled,
            stuck = report.stuck,
            "Drain pass finished"
        );
        Ok(report)
    }

    /// Dispatch ready tasks up to the free capacity.
    async fn dispatch(
        &mut self,
        graph: &mut TaskGraph,
        in_flight: &mut JoinSet<Attempt>,
        running: &mut HashMap<tokio::task::Id, TaskId>,
        retry_at: &HashMap<TaskId, Instant>,
    ) -> Result<usize> {
        let mut dispatched = 0;

        for id in graph.ready(&self.lock) {
            if in_flight.len() >= self.config.max_parallel {
                break;
            }
            if retry_at.contains_key(&id) {
                continue;
            }
            let task = graph
                .get(&id)
                .cloned()
                .ok_or_else(|| Error::TaskNotFound(id.clone()))?;

            // Earlier dispatches in this round may have claimed an overlapping scope.
            if !self.lock.try_acquire(&id, &task.resource_scope) {
                continue;
            }

            self.recovery
                .checkpoint_before(&task, self.records.len())
                .await;
            if let Err(e) = graph.mark_running(&id) {
                self.lock.release(&id);
                return Err(e);
            }

            debug!(task = %id, attempt = task.attempt, assignee = %task.assignee, "Dispatching task");
            self.emit(SchedulerEvent::TaskStarted {
                task_id: id.clone(),
                attempt: task.attempt,
            });

            let executor = Arc::clone(&self.executor);
            let context = Arc::clone(&self.context);
            let timeout = self.config.task_timeout;
            let handle = in_flight.spawn(async move {
                let started_at = Utc::now();
                let context = context.relevant_context(&task).await;
                let outcome = match tokio::time::timeout(timeout, executor.run(&task, &context)).await {
                    Ok(outcome) => outcome,
                    Err(_) => ExecutionOutcome::Failure {
                        kind: ErrorKind::Timeout,
                        detail: format!("attempt timed out after {:?}", timeout),
                    },
                };
                Attempt {
                    task_id: task.id,
                    attempt: task.attempt,
                    started_at,
                    finished_at: Utc::now(),
                    outcome,
                }
            });
            running.insert(handle.id(), id);
            dispatched += 1;
        }

        Ok(dispatched)
    }

    /// Turn a worker that panicked or was aborted into a failed attempt.
    fn lost_attempt(
        &self,
        graph: &TaskGraph,
        running: &mut HashMap<tokio::task::Id, TaskId>,
        join_error: JoinError,
    ) -> Result<Attempt> {
        let task_id = running.remove(&join_error.id()).ok_or_else(|| {
            Error::Validation(format!("completion for unknown worker {}", join_error.id()))
        })?;
        let task = graph
            .get(&task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.clone()))?;
        let detail = if join_error.is_panic() {
            "executor panicked".to_string()
        } else {
            "attempt was aborted".to_string()
        };
        warn!(task = %task_id, %detail, "Worker lost");

        Ok(Attempt {
            attempt: task.attempt,
            started_at: task.started_at.unwrap_or_else(Utc::now),
            finished_at: Utc::now(),
            outcome: ExecutionOutcome::Failure {
                kind: ErrorKind::Transient,
                detail,
            },
            task_id,
        })
    }

    /// Commit the outcome of a finished attempt.
    fn settle(
        &mut self,
        graph: &mut TaskGraph,
        attempt: Attempt,
        retry_at: &mut HashMap<TaskId, Instant>,
    ) -> Result<()> {
        let id = attempt.task_id;
        self.lock.release(&id);
        self.records.push(ExecutionRecord::new(
            id.clone(),
            attempt.attempt,
            attempt.started_at,
            attempt.finished_at,
            &attempt.outcome,
        ));

        match attempt.outcome {
            ExecutionOutcome::Success { output } => {
                graph.mark_completed(&id, output)?;
                info!(task = %id, attempt = attempt.attempt, "Task completed");
                self.emit(SchedulerEvent::TaskCompleted {
                    task_id: id,
                    attempt: attempt.attempt,
                });
            }
            ExecutionOutcome::Failure { kind, detail } => {
                let task = graph
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
                match self.recovery.handle_failure(&task, kind) {
                    RecoveryVerdict::Retry { delay } => {
                        graph.mark_retry(&id, kind, detail)?;
                        retry_at.insert(id.clone(), Instant::now() + delay);
                        self.emit(SchedulerEvent::TaskRetrying {
                            task_id: id,
                            attempt: attempt.attempt,
                            kind,
                            delay,
                        });
                    }
                    RecoveryVerdict::Failed { .. } => {
                        graph.mark_failed(&id, kind, detail.clone())?;
                        self.emit(SchedulerEvent::TaskFailed {
                            task_id: id,
                            kind,
                            detail,
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

/// Earliest retry deadline among tasks still waiting for one.
fn next_retry(graph: &TaskGraph, retry_at: &HashMap<TaskId, Instant>) -> Option<Instant> {
    retry_at
        .iter()
        .filter(|(id, _)| graph.get(id).is_some_and(|t| t.status == TaskStatus::Ready))
        .map(|(_, at)| *at)
        .min()
}
