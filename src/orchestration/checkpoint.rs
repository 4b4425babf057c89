//! Checkpoint stack.
//!
//! A checkpoint is taken right before a task's first attempt. The store is
//! an append-only stack per run: restoring a checkpoint invalidates every
//! checkpoint created after it. The actual snapshot mechanism is behind
//! [`CheckpointBackend`]; the git implementation lives in [`crate::git`].

use crate::core::task::TaskId;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default number of checkpoints retained per run.
pub const DEFAULT_KEEP_CHECKPOINTS: usize = 10;

/// Opaque token identifying a snapshot in the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointRef(pub String);

impl std::fmt::Display for CheckpointRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Something that can snapshot and restore the workspace.
pub trait CheckpointBackend: Send + Sync {
    /// Take a snapshot labelled `label`.
    fn create(&self, label: &str) -> Result<CheckpointRef>;

    /// Bring the workspace back to `reference`.
    fn restore(&self, reference: &CheckpointRef) -> Result<()>;

    /// Drop a snapshot that is no longer retained.
    fn discard(&self, _reference: &CheckpointRef) -> Result<()> {
        Ok(())
    }
}

/// A recovery point taken before a task attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub reference: CheckpointRef,
    pub label: String,
    pub task_id: TaskId,
    pub attempt: u32,
    /// Number of execution records written when the checkpoint was taken.
    pub position: usize,
    pub created_at: DateTime<Utc>,
}

/// Append-only stack of checkpoints with bounded retention.
pub struct CheckpointStore {
    backend: Arc<dyn CheckpointBackend>,
    stack: Vec<Checkpoint>,
    keep: usize,
    sequence: u64,
}

impl CheckpointStore {
    pub fn new(backend: Arc<dyn CheckpointBackend>, keep: usize) -> Self {
        Self {
            backend,
            stack: Vec::new(),
            keep: keep.max(1),
            sequence: 0,
        }
    }

    /// Create a checkpoint preceding `attempt` of `task_id`.
    ///
    /// The backend snapshot runs on the blocking pool so workers already in
    /// flight keep making progress.
    pub async fn create(
        &mut self,
        task_id: &TaskId,
        attempt: u32,
        position: usize,
    ) -> Result<&Checkpoint> {
        self.sequence += 1;
        let label = format!("{:04}-{}-a{}", self.sequence, task_id, attempt);
        let backend = Arc::clone(&self.backend);
        let snapshot_label = label.clone();
        let reference = tokio::task::spawn_blocking(move || backend.create(&snapshot_label)).await??;
        debug!(task = %task_id, %reference, "Checkpoint created");

        self.stack.push(Checkpoint {
            reference,
            label,
            task_id: task_id.clone(),
            attempt,
            position,
            created_at: Utc::now(),
        });
        self.prune();

        self.stack
            .last()
            .ok_or_else(|| Error::Validation("checkpoint stack empty after push".to_string()))
    }

    fn prune(&mut self) {
        while self.stack.len() > self.keep {
            let old = self.stack.remove(0);
            if let Err(e) = self.backend.discard(&old.reference) {
                warn!(checkpoint = %old.label, error = %e, "Failed to discard checkpoint");
            }
        }
    }

    /// Most recent checkpoint taken before `task_id`'s first attempt.
    pub fn latest_for(&self, task_id: &TaskId) -> Option<&Checkpoint> {
        self.stack
            .iter()
            .rev()
            .find(|c| &c.task_id == task_id && c.attempt == 0)
    }

    pub fn has_checkpoint(&self, task_id: &TaskId) -> bool {
        self.latest_for(task_id).is_some()
    }

    /// Restore the checkpoint for `task_id` and drop everything after it.
    ///
    /// # Errors
    /// `CheckpointRestore` if no checkpoint exists or the backend fails.
    pub fn restore_to(&mut self, task_id: &TaskId) -> Result<Checkpoint> {
        let index = self
            .stack
            .iter()
            .rposition(|c| &c.task_id == task_id && c.attempt == 0)
            .ok_or_else(|| Error::CheckpointRestore {
                checkpoint: task_id.to_string(),
                reason: "no checkpoint retained for task".to_string(),
            })?;

        let checkpoint = self.stack[index].clone();
        self.backend
            .restore(&checkpoint.reference)
            .map_err(|e| Error::CheckpointRestore {
                checkpoint: checkpoint.label.clone(),
                reason: e.to_string(),
            })?;

        for newer in self.stack.drain(index + 1..) {
            if let Err(e) = self.backend.discard(&newer.reference) {
                warn!(checkpoint = %newer.label, error = %e, "Failed to discard checkpoint");
            }
        }
        info!(task = %task_id, checkpoint = %checkpoint.label, "Checkpoint restored");
        Ok(checkpoint)
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.stack
    }
}

impl std::fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStore")
            .field("checkpoints", &self.stack.len())
            .field("keep", &self.keep)
            .finish()
    }
}
