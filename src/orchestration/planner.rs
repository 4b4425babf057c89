//! Plan-file planner and the default objective check.
//!
//! A plan file lists tasks in JSON or TOML:
//!
//! ```toml
//! objective = "Add login"
//!
//! [[tasks]]
//! id = "t1"
//! description = "Create the users table"
//! assignee = "backend-dev"
//! resource_scope = ["migrations/"]
//!
//! [[tasks]]
//! id = "t2"
//! description = "Add the login endpoint"
//! assignee = "backend-dev"
//! dependencies = ["t1"]
//! ```
//!
//! The file is re-read on every refinement, so an operator can append tasks
//! while a run is holding and resume it.

use crate::core::graph::GraphSnapshot;
use crate::core::task::{Task, DEFAULT_COMPONENT};
use crate::error::{Error, Result};
use crate::orchestration::collaborators::{ObjectiveCheck, ObjectiveStatus, Planner};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One task as written in a plan file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub id: String,
    pub description: String,
    pub assignee: String,
    #[serde(default, alias = "depends_on")]
    pub dependencies: Vec<String>,
    #[serde(default, alias = "scope")]
    pub resource_scope: Vec<String>,
    #[serde(default)]
    pub component: Option<String>,
}

impl PlanEntry {
    fn into_task(self) -> Task {
        Task::new(self.id, &self.description, &self.assignee)
            .depends_on(self.dependencies)
            .with_scope(self.resource_scope)
            .with_component(self.component.as_deref().unwrap_or(DEFAULT_COMPONENT))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanFile {
    #[serde(default)]
    pub objective: Option<String>,
    #[serde(default)]
    pub tasks: Vec<PlanEntry>,
}

impl PlanFile {
    /// Parse a plan; the format follows the file extension, TOML otherwise.
    pub fn load(path: &Path) -> Result<Self> {
        Self::parse(path, &std::fs::read_to_string(path)?)
    }

    /// [`PlanFile::load`] for use inside the control loop.
    pub async fn read(path: &Path) -> Result<Self> {
        Self::parse(path, &tokio::fs::read_to_string(path).await?)
    }

    fn parse(path: &Path, text: &str) -> Result<Self> {
        let plan: PlanFile = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(text)?,
            _ => toml::from_str(text)?,
        };
        plan.check()?;
        Ok(plan)
    }

    fn check(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for entry in &self.tasks {
            if entry.id.trim().is_empty() {
                return Err(Error::Validation("plan contains a task with an empty id".into()));
            }
            if entry.assignee.trim().is_empty() {
                return Err(Error::Validation(format!(
                    "task {} has no assignee",
                    entry.id
                )));
            }
            if !seen.insert(entry.id.as_str()) {
                return Err(Error::DuplicateTask(entry.id.as_str().into()));
            }
        }
        Ok(())
    }

    pub fn into_tasks(self) -> Vec<Task> {
        self.tasks.into_iter().map(PlanEntry::into_task).collect()
    }
}

/// Planner backed by a plan file on disk.
#[derive(Debug, Clone)]
pub struct PlanFilePlanner {
    path: PathBuf,
}

impl PlanFilePlanner {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Planner for PlanFilePlanner {
    async fn split_objective(&self, objective: &str, _context: &str) -> Result<Vec<Task>> {
        let plan = PlanFile::read(&self.path).await?;
        info!(
            objective,
            tasks = plan.tasks.len(),
            path = %self.path.display(),
            "Loaded plan"
        );
        Ok(plan.into_tasks())
    }

    async fn refine(&self, snapshot: &GraphSnapshot, _context: &str) -> Result<Vec<Task>> {
        let fresh: Vec<Task> = PlanFile::read(&self.path)
            .await?
            .into_tasks()
            .into_iter()
            .filter(|t| !snapshot.contains(&t.id))
            .collect();
        debug!(new_tasks = fresh.len(), "Refined plan");
        Ok(fresh)
    }
}

/// Objective check that is met once every task has completed.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllTasksCompleted;

#[async_trait]
impl ObjectiveCheck for AllTasksCompleted {
    async fn evaluate(&self, snapshot: &GraphSnapshot, _objective: &str) -> Result<ObjectiveStatus> {
        if snapshot.all_completed() {
            Ok(ObjectiveStatus::Met)
        } else {
            Ok(ObjectiveStatus::Unmet)
        }
    }
}
