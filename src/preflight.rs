//! Pre-flight checks run before an orchestration starts.

use std::path::Path;

use git2::Repository;
use serde::Serialize;

use crate::config::Config;
use crate::core::graph::TaskGraph;
use crate::orchestration::{PlanFile, ProfileRegistry};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, message: impl Into<String>, fix: Option<&str>) {
        self.errors.push(message.into());
        if let Some(fix) = fix {
            self.suggestions.push(fix.to_string());
        }
    }

    fn warn(&mut self, message: impl Into<String>, fix: Option<&str>) {
        self.warnings.push(message.into());
        if let Some(fix) = fix {
            self.suggestions.push(fix.to_string());
        }
    }
}

/// Check that `project` and `config` can support a run.
pub fn validate(project: &Path, config: &Config) -> ValidationReport {
    let mut report = ValidationReport::default();

    if !project.is_dir() {
        report.error(
            format!("project directory does not exist: {}", project.display()),
            Some("pass an existing directory with --project-dir"),
        );
        return report;
    }

    if let Err(e) = config.validate() {
        report.error(e.to_string(), Some("fix the config file or run `orchestra config init`"));
    }

    if config.rollback.checkpoints_active() {
        if Repository::discover(project).is_err() {
            report.error(
                format!("{} is not inside a git repository", project.display()),
                Some("run `git init` or disable checkpoints with rollback.enabled = false"),
            );
        }
    } else if config.rollback.auto_rollback {
        report.warn(
            "auto_rollback is set but checkpoints are disabled",
            Some("set rollback.enabled and rollback.create_checkpoints to true"),
        );
    }

    let registry = ProfileRegistry::from_config(&config.executor);
    if registry.is_empty() {
        report.warn(
            "no executor profiles or default command configured; every task will fail",
            Some("add [[executor.profiles]] entries or executor.default_command"),
        );
    }
    for program in registry.programs() {
        let found = if program.contains(std::path::MAIN_SEPARATOR) || program.contains('/') {
            Path::new(program).exists() || project.join(program).exists()
        } else {
            which::which(program).is_ok()
        };
        if !found {
            report.error(
                format!("executor command not found: {}", program),
                Some("install the command or fix its path in the executor config"),
            );
        }
    }

    report
}

/// Check that a plan file parses and forms a valid graph.
pub fn check_plan(report: &mut ValidationReport, plan: &Path) {
    match PlanFile::load(plan) {
        Ok(plan) if plan.tasks.is_empty() => {
            report.warn("plan contains no tasks", None);
        }
        Ok(plan) => {
            if let Err(e) = TaskGraph::new(plan.into_tasks(), 1) {
                report.error(format!("invalid plan: {}", e), None);
            }
        }
        Err(e) => report.error(
            format!("cannot load plan {}: {}", plan.display(), e),
            None,
        ),
    }
}
