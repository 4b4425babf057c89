//! Orchestration layer.
//!
//! The [`IterationController`] plans work through a [`Planner`], hands the
//! resulting [`TaskGraph`](crate::core::TaskGraph) to the [`Scheduler`] for
//! a draining pass, and evaluates the outcome. The scheduler runs attempts
//! through an [`Executor`] under a [`ResourceLock`], and routes failures to
//! the [`ErrorRecoveryManager`] for retry, checkpoint rollback, or a
//! terminal failure.

mod checkpoint;
mod collaborators;
mod context;
mod controller;
mod executor;
mod lock;
mod planner;
mod recovery;
mod retry;
mod scheduler;
mod summary;

pub use checkpoint::{
    Checkpoint, CheckpointBackend, CheckpointRef, CheckpointStore, DEFAULT_KEEP_CHECKPOINTS,
};
pub use collaborators::{
    ContextProvider, Executor, NoContext, ObjectiveCheck, ObjectiveStatus, Planner,
};
pub use context::{ProjectContext, CONTEXT_DIR};
pub use controller::{IterationController, Phase, PhaseHistoryEntry, DEFAULT_MAX_ITERATIONS};
pub use executor::{build_prompt, CommandExecutor, Profile, ProfileRegistry};
pub use lock::{normalize, patterns_overlap, ResourceLock};
pub use planner::{AllTasksCompleted, PlanEntry, PlanFile, PlanFilePlanner};
pub use recovery::{ErrorRecoveryManager, RecoveryVerdict, RollbackReport};
pub use retry::{
    RetryDecision, RetryPolicy, DEFAULT_BACKOFF_FACTOR, DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_MAX_BACKOFF,
};
pub use scheduler::{
    DrainReport, Scheduler, SchedulerConfig, SchedulerEvent, DEFAULT_MAX_PARALLEL,
    DEFAULT_TASK_TIMEOUT,
};
pub use summary::{FailureReport, HoldReason, RunContext, RunStatus, RunSummary, StopReason};
