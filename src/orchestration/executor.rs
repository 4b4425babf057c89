//! Executor that runs each task as an external command.
//!
//! A task's assignee selects an execution profile from the config. The
//! profile's command line is run in the project directory with the task
//! prompt appended as its final argument. Exit code zero is success and the
//! trimmed stdout becomes the task output; anything else is a failure whose
//! detail is classified into an [`ErrorKind`].

use crate::config::{ExecutorConfig, ProfileConfig};
use crate::core::record::{ErrorKind, ExecutionOutcome};
use crate::core::task::Task;
use crate::orchestration::collaborators::Executor;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// A resolved command line plus extra environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl Profile {
    fn from_command(command: &[String], env: BTreeMap<String, String>) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            env,
        })
    }
}

/// Assignee name to command mapping.
#[derive(Debug, Clone, Default)]
pub struct ProfileRegistry {
    profiles: HashMap<String, Profile>,
    default: Option<Profile>,
}

impl ProfileRegistry {
    pub fn from_config(config: &ExecutorConfig) -> Self {
        let mut registry = Self {
            profiles: HashMap::new(),
            default: config
                .default_command
                .as_deref()
                .and_then(|c| Profile::from_command(c, BTreeMap::new())),
        };
        for profile in &config.profiles {
            registry.insert(profile);
        }
        registry
    }

    pub fn insert(&mut self, config: &ProfileConfig) {
        match Profile::from_command(&config.command, config.env.clone()) {
            Some(profile) => {
                self.profiles.insert(config.name.clone(), profile);
            }
            None => warn!(profile = %config.name, "Ignoring profile with empty command"),
        }
    }

    /// Profile for `assignee`, falling back to the default command.
    pub fn resolve(&self, assignee: &str) -> Option<&Profile> {
        self.profiles.get(assignee).or(self.default.as_ref())
    }

    /// Every distinct program the registry can launch.
    pub fn programs(&self) -> Vec<&str> {
        let mut programs: Vec<&str> = self
            .profiles
            .values()
            .chain(self.default.as_ref())
            .map(|p| p.program.as_str())
            .collect();
        programs.sort_unstable();
        programs.dedup();
        programs
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty() && self.default.is_none()
    }
}

/// Runs tasks as child processes.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    registry: ProfileRegistry,
    project_dir: PathBuf,
}

impl CommandExecutor {
    pub fn new(registry: ProfileRegistry, project_dir: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            project_dir: project_dir.into(),
        }
    }

    pub fn registry(&self) -> &ProfileRegistry {
        &self.registry
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }
}

/// Prompt text handed to the command for `task`.
pub fn build_prompt(task: &Task, context: &str) -> String {
    let mut prompt = format!("Task {}: {}", task.id, task.description);
    if !task.resource_scope.is_empty() {
        let scope: Vec<&str> = task.resource_scope.iter().map(String::as_str).collect();
        prompt.push_str(&format!("\n\nOnly modify: {}", scope.join(", ")));
    }
    if !context.trim().is_empty() {
        prompt.push_str("\n\n## Context\n\n");
        prompt.push_str(context.trim());
    }
    prompt
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn run(&self, task: &Task, context: &str) -> ExecutionOutcome {
        let Some(profile) = self.registry.resolve(&task.assignee) else {
            return ExecutionOutcome::Failure {
                kind: ErrorKind::Validation,
                detail: format!("no execution profile for assignee '{}'", task.assignee),
            };
        };

        debug!(task = %task.id, program = %profile.program, "Spawning task command");
        let output = Command::new(&profile.program)
            .args(&profile.args)
            .arg(build_prompt(task, context))
            .envs(&profile.env)
            .current_dir(&self.project_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return ExecutionOutcome::Failure {
                    kind: ErrorKind::Validation,
                    detail: format!("command not found: {}", profile.program),
                };
            }
            Err(e) => return ExecutionOutcome::failure(format!("failed to spawn: {}", e)),
        };

        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            return ExecutionOutcome::Success {
                output: stdout.trim().to_string(),
            };
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = if stderr.trim().is_empty() {
            match output.status.code() {
                Some(code) => format!("exited with code {}", code),
                None => "terminated by signal".to_string(),
            }
        } else {
            stderr.trim().to_string()
        };
        ExecutionOutcome::failure(detail)
    }
}
