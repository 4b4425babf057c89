//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A scripted executor that records when each attempt ran
//! - In-memory checkpoints
//! - Static planners and objective checks
//! - Temporary git repositories

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use git2::{IndexAddOption, Repository, Signature};
use tempfile::TempDir;
use tokio::time::Instant;

use orchestra::core::{ErrorKind, ExecutionOutcome, GraphSnapshot, Task, TaskId};
use orchestra::orchestration::{
    patterns_overlap, CheckpointBackend, CheckpointRef, CheckpointStore, ErrorRecoveryManager,
    Executor, NoContext, ObjectiveCheck, ObjectiveStatus, Planner, RetryPolicy, Scheduler,
    SchedulerConfig,
};
use orchestra::{Error, Result};

/// One scripted step for a task attempt.
#[derive(Debug, Clone)]
pub enum Step {
    Succeed,
    Fail(ErrorKind, &'static str),
    /// Panic inside the worker.
    Panic,
}

/// When an attempt ran, on the tokio clock and as a global sequence.
#[derive(Debug, Clone)]
pub struct Span {
    pub task: TaskId,
    pub started: Instant,
    pub finished: Instant,
    pub start_seq: u64,
    pub end_seq: u64,
}

impl Span {
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start_seq < other.end_seq && other.start_seq < self.end_seq
    }
}

/// Executor whose behaviour per task is scripted in advance.
///
/// Each attempt pops the next step for its task (success when the script
/// is empty), sleeps for the task's duration, and records a [`Span`].
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<TaskId, VecDeque<Step>>>,
    durations: Mutex<HashMap<TaskId, Duration>>,
    default_duration: Duration,
    workdir: Option<PathBuf>,
    spans: Mutex<Vec<Span>>,
    active: Mutex<Vec<(TaskId, BTreeSet<String>)>>,
    peak: Mutex<usize>,
    scope_violations: Mutex<Vec<(TaskId, TaskId)>>,
    sequence: AtomicU64,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            default_duration: Duration::from_millis(10),
            ..Default::default()
        }
    }

    /// Successful attempts write `<task>.txt` into `dir`.
    pub fn writing_to(dir: &Path) -> Self {
        Self {
            workdir: Some(dir.to_path_buf()),
            ..Self::new()
        }
    }

    pub fn script(self, task: &str, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(TaskId::from(task), steps.into());
        self
    }

    pub fn duration(self, task: &str, duration: Duration) -> Self {
        self.durations
            .lock()
            .unwrap()
            .insert(TaskId::from(task), duration);
        self
    }

    pub fn default_duration(mut self, duration: Duration) -> Self {
        self.default_duration = duration;
        self
    }

    pub fn spans(&self) -> Vec<Span> {
        self.spans.lock().unwrap().clone()
    }

    pub fn spans_of(&self, task: &str) -> Vec<Span> {
        self.spans()
            .into_iter()
            .filter(|s| s.task.as_str() == task)
            .collect()
    }

    pub fn attempts(&self, task: &str) -> usize {
        self.spans_of(task).len()
    }

    pub fn peak_concurrency(&self) -> usize {
        *self.peak.lock().unwrap()
    }

    /// Pairs of tasks that ran at once with overlapping scopes.
    pub fn scope_violations(&self) -> Vec<(TaskId, TaskId)> {
        self.scope_violations.lock().unwrap().clone()
    }

    fn next_step(&self, task: &TaskId) -> Step {
        self.scripts
            .lock()
            .unwrap()
            .get_mut(task)
            .and_then(|s| s.pop_front())
            .unwrap_or(Step::Succeed)
    }

    fn enter(&self, task: &Task) {
        let mut active = self.active.lock().unwrap();
        for (other, scope) in active.iter() {
            let clash = task
                .resource_scope
                .iter()
                .any(|a| scope.iter().any(|b| patterns_overlap(a, b)));
            if clash {
                self.scope_violations
                    .lock()
                    .unwrap()
                    .push((task.id.clone(), other.clone()));
            }
        }
        active.push((task.id.clone(), task.resource_scope.clone()));
        let mut peak = self.peak.lock().unwrap();
        *peak = (*peak).max(active.len());
    }

    fn leave(&self, task: &TaskId) {
        self.active.lock().unwrap().retain(|(id, _)| id != task);
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn run(&self, task: &Task, _context: &str) -> ExecutionOutcome {
        let started = Instant::now();
        let start_seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        self.enter(task);

        let duration = self
            .durations
            .lock()
            .unwrap()
            .get(&task.id)
            .copied()
            .unwrap_or(self.default_duration);
        tokio::time::sleep(duration).await;

        let step = self.next_step(&task.id);
        if let Some(dir) = &self.workdir {
            std::fs::write(dir.join(format!("{}.txt", task.id)), task.description.as_bytes())
                .unwrap();
        }

        self.leave(&task.id);
        self.spans.lock().unwrap().push(Span {
            task: task.id.clone(),
            started,
            finished: Instant::now(),
            start_seq,
            end_seq: self.sequence.fetch_add(1, Ordering::SeqCst),
        });

        match step {
            Step::Succeed => ExecutionOutcome::Success {
                output: format!("{} done", task.id),
            },
            Step::Fail(kind, detail) => ExecutionOutcome::Failure {
                kind,
                detail: detail.to_string(),
            },
            Step::Panic => panic!("scripted panic in {}", task.id),
        }
    }
}

/// Checkpoint backend that keeps labels in memory.
#[derive(Default)]
pub struct MemoryCheckpointBackend {
    pub created: Mutex<Vec<String>>,
    pub restored: Mutex<Vec<String>>,
    pub discarded: Mutex<Vec<String>>,
    pub fail_restore: bool,
}

impl MemoryCheckpointBackend {
    pub fn broken() -> Self {
        Self {
            fail_restore: true,
            ..Default::default()
        }
    }

    pub fn restored(&self) -> Vec<String> {
        self.restored.lock().unwrap().clone()
    }
}

impl CheckpointBackend for MemoryCheckpointBackend {
    fn create(&self, label: &str) -> Result<CheckpointRef> {
        self.created.lock().unwrap().push(label.to_string());
        Ok(CheckpointRef(label.to_string()))
    }

    fn restore(&self, reference: &CheckpointRef) -> Result<()> {
        if self.fail_restore {
            return Err(Error::Validation("snapshot missing".to_string()));
        }
        self.restored.lock().unwrap().push(reference.0.clone());
        Ok(())
    }

    fn discard(&self, reference: &CheckpointRef) -> Result<()> {
        self.discarded.lock().unwrap().push(reference.0.clone());
        Ok(())
    }
}

/// Planner returning a fixed initial task set and queued refinements.
pub struct StaticPlanner {
    initial: Vec<Task>,
    refinements: Mutex<VecDeque<Result<Vec<Task>>>>,
    pub refine_calls: Mutex<usize>,
}

impl StaticPlanner {
    pub fn new(initial: Vec<Task>) -> Self {
        Self {
            initial,
            refinements: Mutex::new(VecDeque::new()),
            refine_calls: Mutex::new(0),
        }
    }

    pub fn then(self, tasks: Vec<Task>) -> Self {
        self.refinements.lock().unwrap().push_back(Ok(tasks));
        self
    }

    pub fn then_fail(self, message: &str) -> Self {
        self.refinements
            .lock()
            .unwrap()
            .push_back(Err(Error::Validation(message.to_string())));
        self
    }

    pub fn refine_calls(&self) -> usize {
        *self.refine_calls.lock().unwrap()
    }
}

#[async_trait]
impl Planner for StaticPlanner {
    async fn split_objective(&self, _objective: &str, _context: &str) -> Result<Vec<Task>> {
        Ok(self.initial.clone())
    }

    async fn refine(&self, _snapshot: &GraphSnapshot, _context: &str) -> Result<Vec<Task>> {
        *self.refine_calls.lock().unwrap() += 1;
        self.refinements
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

/// Objective check that always answers the same.
pub struct FixedObjective(pub ObjectiveStatus);

#[async_trait]
impl ObjectiveCheck for FixedObjective {
    async fn evaluate(&self, _snapshot: &GraphSnapshot, _objective: &str) -> Result<ObjectiveStatus> {
        Ok(self.0.clone())
    }
}

pub fn id(s: &str) -> TaskId {
    TaskId::from(s)
}

pub fn task(id: &str) -> Task {
    Task::new(id, &format!("work on {}", id), "dev")
}

/// Retry policy with short delays.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::default().with_base_delay(Duration::from_millis(10))
}

pub fn scheduler(executor: Arc<dyn Executor>, max_parallel: usize, recovery: ErrorRecoveryManager) -> Scheduler {
    Scheduler::new(
        executor,
        Arc::new(NoContext),
        SchedulerConfig {
            max_parallel,
            task_timeout: Duration::from_secs(5),
        },
        recovery,
    )
}

/// Recovery manager with in-memory checkpoints and auto-rollback.
pub fn rollback_recovery(backend: Arc<MemoryCheckpointBackend>, policy: RetryPolicy) -> ErrorRecoveryManager {
    ErrorRecoveryManager::new(policy)
        .with_checkpoints(CheckpointStore::new(backend, 10))
        .with_auto_rollback(true)
}

/// A temporary git repository with one commit.
pub struct TestRepo {
    pub temp_dir: TempDir,
    pub path: PathBuf,
}

impl TestRepo {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_path_buf();
        let repo = Repository::init(&path).expect("Failed to init repo");
        {
            let mut config = repo.config().unwrap();
            config.set_str("user.name", "Test User").unwrap();
            config.set_str("user.email", "test@test.com").unwrap();
        }
        std::fs::write(path.join("README.md"), "# Test Repository\n").unwrap();
        let repo_handle = Self { temp_dir, path };
        repo_handle.commit_all("Initial commit");
        repo_handle
    }

    pub fn commit_all(&self, message: &str) {
        let repo = Repository::open(&self.path).unwrap();
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = Signature::now("Test User", "test@test.com").unwrap();
        let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
            .unwrap();
    }

    pub fn head(&self) -> git2::Oid {
        Repository::open(&self.path)
            .unwrap()
            .head()
            .unwrap()
            .target()
            .unwrap()
    }

    pub fn exists(&self, file: &str) -> bool {
        self.path.join(file).exists()
    }
}
