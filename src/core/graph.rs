//! Task dependency graph.
//!
//! The graph owns every task of an orchestration run together with the
//! dependency edges between them. Validation (duplicate ids, unknown
//! dependencies, cycles) happens only at construction and on merge; once a
//! `TaskGraph` exists it is acyclic, so the scheduler never has to detect
//! deadlocks at runtime.
//!
//! Edges point from a dependency to its dependent, so the incoming
//! neighbours of a node are the tasks it waits for.

use crate::core::record::ErrorKind;
use crate::core::task::{Task, TaskId, TaskResult, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::ResourceLock;
use chrono::Utc;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Number of tasks per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub ready: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.ready + self.running + self.completed + self.failed + self.blocked
    }
}

/// A pending task that can never start because a prerequisite is
/// terminally failed or blocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Unsatisfiable {
    pub task: TaskId,
    /// The failed or blocked task at the root of the chain.
    pub blocked_by: TaskId,
}

/// Serializable view of the graph handed to collaborators and persisted
/// between iterations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub iteration: u32,
    pub tasks: Vec<Task>,
}

impl GraphSnapshot {
    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    pub fn all_completed(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.iter().all(|t| t.status == TaskStatus::Completed)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.get(id).is_some()
    }

    /// Read a snapshot written by [`GraphSnapshot::save`].
    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Write the snapshot as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// The dependency-annotated task collection of one orchestration run.
pub struct TaskGraph {
    tasks: BTreeMap<TaskId, Task>,
    graph: DiGraph<TaskId, ()>,
    index: HashMap<TaskId, NodeIndex>,
    iteration: u32,
}

impl TaskGraph {
    /// Build a validated graph.
    ///
    /// # Errors
    /// - `DuplicateTask` if two tasks share an id
    /// - `UnknownDependency` if a dependency names no task in the set
    /// - `CyclicDependency` naming one offending cycle
    pub fn new(tasks: Vec<Task>, iteration: u32) -> Result<Self> {
        let mut map = BTreeMap::new();
        for task in tasks {
            if map.contains_key(&task.id) {
                return Err(Error::DuplicateTask(task.id));
            }
            map.insert(task.id.clone(), task);
        }
        Self::build(map, iteration)
    }

    /// An empty graph for the first planning round.
    pub fn empty() -> Self {
        Self {
            tasks: BTreeMap::new(),
            graph: DiGraph::new(),
            index: HashMap::new(),
            iteration: 0,
        }
    }

    /// Rebuild a graph from a persisted snapshot.
    ///
    /// Tasks that were running when the snapshot was taken have no live
    /// attempt any more and come back as `Ready`.
    pub fn from_snapshot(snapshot: GraphSnapshot) -> Result<Self> {
        let tasks = snapshot
            .tasks
            .into_iter()
            .map(|mut task| {
                if task.status == TaskStatus::Running {
                    task.status = TaskStatus::Ready;
                    task.started_at = None;
                }
                task
            })
            .collect();
        Self::new(tasks, snapshot.iteration)
    }

    fn build(tasks: BTreeMap<TaskId, Task>, iteration: u32) -> Result<Self> {
        for task in tasks.values() {
            if let Some(missing) = task.dependencies.iter().find(|d| !tasks.contains_key(*d)) {
                return Err(Error::UnknownDependency {
                    task: task.id.clone(),
                    dependency: missing.clone(),
                });
            }
        }

        let mut graph = DiGraph::with_capacity(tasks.len(), 0);
        let mut index = HashMap::with_capacity(tasks.len());
        for id in tasks.keys() {
            index.insert(id.clone(), graph.add_node(id.clone()));
        }
        for task in tasks.values() {
            for dep in &task.dependencies {
                graph.add_edge(index[dep], index[&task.id], ());
            }
        }

        if let Some(cycle) = find_cycle(&graph) {
            return Err(Error::CyclicDependency { cycle });
        }

        Ok(Self {
            tasks,
            graph,
            index,
            iteration,
        })
    }

    /// Merge newly planned tasks into the graph.
    ///
    /// Ids already present are kept as they are (prior iterations persist).
    /// New tasks start `Pending` at attempt 0 and are stamped with the
    /// current iteration. Either every new task is merged or none is.
    ///
    /// Returns the number of tasks added.
    pub fn merge(&mut self, incoming: Vec<Task>) -> Result<usize> {
        let mut candidate = self.tasks.clone();
        let mut seen = HashSet::new();
        let mut added = 0;

        for mut task in incoming {
            if !seen.insert(task.id.clone()) {
                return Err(Error::DuplicateTask(task.id));
            }
            if candidate.contains_key(&task.id) {
                debug!(task = %task.id, "Task already in graph, keeping existing entry");
                continue;
            }
            task.status = TaskStatus::Pending;
            task.attempt = 0;
            task.result = None;
            task.started_at = None;
            task.completed_at = None;
            task.iteration = self.iteration;
            candidate.insert(task.id.clone(), task);
            added += 1;
        }

        if added > 0 {
            *self = Self::build(candidate, self.iteration)?;
            info!(added, total = self.len(), iteration = self.iteration, "Merged planned tasks");
        }
        Ok(added)
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// Start a new iteration and return its number.
    pub fn begin_iteration(&mut self) -> u32 {
        self.iteration += 1;
        self.iteration
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks in id order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            iteration: self.iteration,
            tasks: self.tasks.values().cloned().collect(),
        }
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for task in self.tasks.values() {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Ready => counts.ready += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Blocked => counts.blocked += 1,
            }
        }
        counts
    }

    /// Ids with the given status, in id order.
    pub fn with_status(&self, status: TaskStatus) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|t| t.status == status)
            .map(|t| t.id.clone())
            .collect()
    }

    /// Tasks the given task waits for.
    pub fn dependencies_of(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbours(id, Direction::Incoming)
    }

    /// Tasks that wait for the given task.
    pub fn dependents_of(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbours(id, Direction::Outgoing)
    }

    fn neighbours(&self, id: &TaskId, direction: Direction) -> Vec<TaskId> {
        let Some(&node) = self.index.get(id) else {
            return Vec::new();
        };
        let mut ids: Vec<TaskId> = self
            .graph
            .neighbors_directed(node, direction)
            .map(|n| self.graph[n].clone())
            .collect();
        ids.sort();
        ids
    }

    /// Tasks in an order where every task follows its dependencies.
    pub fn topological_order(&self) -> Result<Vec<TaskId>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| Error::CyclicDependency {
            cycle: vec![self.graph[cycle.node_id()].clone()],
        })?;
        Ok(sorted.into_iter().map(|n| self.graph[n].clone()).collect())
    }

    fn dependencies_completed(&self, task: &Task) -> bool {
        task.dependencies.iter().all(|dep| {
            self.tasks
                .get(dep)
                .is_some_and(|d| d.status == TaskStatus::Completed)
        })
    }

    // ========== Scheduling queries ==========

    /// Tasks that may be dispatched now, sorted by id.
    ///
    /// A task qualifies when it is `Pending` or `Ready`, every dependency is
    /// `Completed`, and its resource scope overlaps nothing currently held
    /// in `lock`.
    pub fn ready(&self, lock: &ResourceLock) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|t| t.can_start())
            .filter(|t| self.dependencies_completed(t))
            .filter(|t| !lock.conflicts(&t.resource_scope))
            .map(|t| t.id.clone())
            .collect()
    }

    /// Whether every task is terminal.
    pub fn is_drained(&self) -> bool {
        !self.tasks.values().any(|t| {
            matches!(
                t.status,
                TaskStatus::Pending | TaskStatus::Ready | TaskStatus::Running
            )
        })
    }

    /// Whether pending work exists that can never start.
    ///
    /// True when nothing is running or ready, at least one task is pending,
    /// and no pending task has all of its dependencies completed.
    pub fn is_stuck(&self) -> bool {
        let mut any_pending = false;
        for task in self.tasks.values() {
            match task.status {
                TaskStatus::Running | TaskStatus::Ready => return false,
                TaskStatus::Pending => {
                    if self.dependencies_completed(task) {
                        return false;
                    }
                    any_pending = true;
                }
                _ => {}
            }
        }
        any_pending
    }

    /// Pending tasks cut off by a failed or blocked prerequisite, directly
    /// or through other pending tasks.
    pub fn unsatisfiable(&self) -> Vec<Unsatisfiable> {
        let Ok(order) = self.topological_order() else {
            return Vec::new();
        };

        let mut root_of: HashMap<&TaskId, TaskId> = HashMap::new();
        for id in &order {
            let task = &self.tasks[id];
            if task.status != TaskStatus::Pending {
                continue;
            }
            let root = task.dependencies.iter().find_map(|dep| {
                let dep_task = &self.tasks[dep];
                match dep_task.status {
                    TaskStatus::Failed | TaskStatus::Blocked => Some(dep.clone()),
                    _ => root_of.get(dep).cloned(),
                }
            });
            if let Some(root) = root {
                root_of.insert(&task.id, root);
            }
        }

        let mut out: Vec<Unsatisfiable> = root_of
            .into_iter()
            .map(|(task, blocked_by)| Unsatisfiable {
                task: task.clone(),
                blocked_by,
            })
            .collect();
        out.sort_by(|a, b| a.task.cmp(&b.task));
        out
    }

    // ========== Transitions ==========

    fn transition(
        &mut self,
        id: &TaskId,
        allowed: &[TaskStatus],
        to: TaskStatus,
    ) -> Result<&mut Task> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
        if !allowed.contains(&task.status) {
            return Err(Error::InvalidTransition {
                task: id.clone(),
                from: task.status,
                to,
            });
        }
        debug!(task = %id, from = %task.status, %to, "Task transition");
        task.status = to;
        Ok(task)
    }

    /// `Pending -> Ready` once dependencies are met.
    pub fn promote_ready(&mut self, id: &TaskId) -> Result<()> {
        let met = self
            .tasks
            .get(id)
            .map(|t| self.dependencies_completed(t))
            .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
        if !met {
            let from = self.tasks[id].status;
            return Err(Error::InvalidTransition {
                task: id.clone(),
                from,
                to: TaskStatus::Ready,
            });
        }
        self.transition(id, &[TaskStatus::Pending], TaskStatus::Ready)?;
        Ok(())
    }

    /// Keep `Ready` in step with dependency state.
    ///
    /// `Pending` tasks whose dependencies all completed become `Ready`;
    /// `Ready` tasks whose dependencies were rolled back return to
    /// `Pending`. Returns the number of tasks promoted.
    pub fn refresh_ready(&mut self) -> Result<usize> {
        let mut promote = Vec::new();
        let mut demote = Vec::new();
        for task in self.tasks.values() {
            let met = self.dependencies_completed(task);
            match task.status {
                TaskStatus::Pending if met => promote.push(task.id.clone()),
                TaskStatus::Ready if !met => demote.push(task.id.clone()),
                _ => {}
            }
        }
        for id in &promote {
            self.promote_ready(id)?;
        }
        for id in &demote {
            self.transition(id, &[TaskStatus::Ready], TaskStatus::Pending)?;
        }
        Ok(promote.len())
    }

    /// `Ready -> Running`.
    ///
    /// Starting a task whose dependencies are not all completed is a
    /// contract violation.
    pub fn mark_running(&mut self, id: &TaskId) -> Result<()> {
        let (met, from) = self
            .tasks
            .get(id)
            .map(|t| (self.dependencies_completed(t), t.status))
            .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
        if !met {
            return Err(Error::InvalidTransition {
                task: id.clone(),
                from,
                to: TaskStatus::Running,
            });
        }
        let task = self.transition(id, &[TaskStatus::Ready], TaskStatus::Running)?;
        task.started_at = Some(Utc::now());
        Ok(())
    }

    /// `Running -> Completed`.
    pub fn mark_completed(&mut self, id: &TaskId, output: String) -> Result<()> {
        let task = self.transition(id, &[TaskStatus::Running], TaskStatus::Completed)?;
        task.result = Some(TaskResult::Success { output });
        task.completed_at = Some(Utc::now());
        Ok(())
    }

    /// `Running -> Ready` for another attempt.
    pub fn mark_retry(&mut self, id: &TaskId, kind: ErrorKind, detail: String) -> Result<()> {
        let task = self.transition(id, &[TaskStatus::Running], TaskStatus::Ready)?;
        task.attempt += 1;
        task.result = Some(TaskResult::Failure { kind, detail });
        Ok(())
    }

    /// `Running -> Failed`, terminal.
    pub fn mark_failed(&mut self, id: &TaskId, kind: ErrorKind, detail: String) -> Result<()> {
        let task = self.transition(id, &[TaskStatus::Running], TaskStatus::Failed)?;
        task.result = Some(TaskResult::Failure { kind, detail });
        task.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Put a task back to `Pending` after its effects were rolled back.
    pub fn reset_pending(&mut self, id: &TaskId) -> Result<()> {
        let task = self.transition(
            id,
            &[TaskStatus::Pending, TaskStatus::Ready, TaskStatus::Completed],
            TaskStatus::Pending,
        )?;
        task.attempt = 0;
        task.result = None;
        task.started_at = None;
        task.completed_at = None;
        Ok(())
    }

    /// Set a task aside so it is never dispatched.
    pub fn mark_blocked(&mut self, id: &TaskId) -> Result<()> {
        self.transition(
            id,
            &[TaskStatus::Pending, TaskStatus::Ready],
            TaskStatus::Blocked,
        )?;
        Ok(())
    }

    /// Operator clears a terminal failure: `Failed -> Pending`, fresh attempts.
    pub fn clear_failure(&mut self, id: &TaskId) -> Result<()> {
        let task = self.transition(id, &[TaskStatus::Failed], TaskStatus::Pending)?;
        task.attempt = 0;
        task.started_at = None;
        task.completed_at = None;
        Ok(())
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.tasks.len())
            .field("dependencies", &self.graph.edge_count())
            .field("iteration", &self.iteration)
            .finish()
    }
}

/// Find one cycle, following "depends on" edges, starting from the
/// smallest id of the first cyclic component.
fn find_cycle(graph: &DiGraph<TaskId, ()>) -> Option<Vec<TaskId>> {
    let mut components: Vec<Vec<NodeIndex>> = tarjan_scc(graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .collect();
    if components.is_empty() {
        return None;
    }
    for scc in components.iter_mut() {
        scc.sort_by(|a, b| graph[*a].cmp(&graph[*b]));
    }
    components.sort_by(|a, b| graph[a[0]].cmp(&graph[b[0]]));

    let scc = &components[0];
    let start = scc[0];
    if graph.contains_edge(start, start) {
        return Some(vec![graph[start].clone(), graph[start].clone()]);
    }

    let members: HashSet<NodeIndex> = scc.iter().copied().collect();
    let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut queue = VecDeque::from([start]);

    while let Some(node) = queue.pop_front() {
        let mut next: Vec<NodeIndex> = graph
            .neighbors_directed(node, Direction::Incoming)
            .filter(|n| members.contains(n))
            .collect();
        next.sort_by(|a, b| graph[*a].cmp(&graph[*b]));

        for n in next {
            if n == start {
                let mut path = vec![graph[start].clone()];
                let mut cursor = node;
                let mut tail = Vec::new();
                while cursor != start {
                    tail.push(graph[cursor].clone());
                    cursor = parent[&cursor];
                }
                tail.reverse();
                path.extend(tail);
                path.push(graph[start].clone());
                return Some(path);
            }
            if n != start && !parent.contains_key(&n) {
                parent.insert(n, node);
                queue.push_back(n);
            }
        }
    }

    Some(scc.iter().map(|n| graph[*n].clone()).collect())
}
