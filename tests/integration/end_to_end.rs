//! Full runs with a plan file, project context and real child processes.

#![cfg(unix)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use orchestra::config::{ExecutorConfig, ProfileConfig};
use orchestra::core::{ErrorKind, GraphSnapshot, TaskGraph, TaskStatus};
use orchestra::orchestration::{
    AllTasksCompleted, CommandExecutor, ErrorRecoveryManager, HoldReason, IterationController,
    PlanFilePlanner, ProfileRegistry, ProjectContext, RetryPolicy, RunStatus, Scheduler,
    SchedulerConfig, StopReason,
};

use crate::fixtures::id;

const PLAN: &str = r#"
objective = "Add a login endpoint"

[[tasks]]
id = "schema"
description = "Create the users table"
assignee = "backend"
scope = ["migrations/"]

[[tasks]]
id = "endpoint"
description = "Add POST /login"
assignee = "backend"
depends_on = ["schema"]
scope = ["src/api/"]
component = "api"

[[tasks]]
id = "docs"
description = "Document the endpoint"
assignee = "writer"
depends_on = ["endpoint"]
"#;

/// Appends the prompt it receives to `prompts.log` in the project.
fn recording_profile(name: &str) -> ProfileConfig {
    ProfileConfig {
        name: name.to_string(),
        command: vec![
            "sh".to_string(),
            "-c".to_string(),
            "printf '%s\\n===\\n' \"$1\" >> prompts.log; echo \"$ROLE done\"".to_string(),
            "orchestra".to_string(),
        ],
        env: BTreeMap::from([("ROLE".to_string(), name.to_string())]),
    }
}

fn project() -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("plan.toml"), PLAN).unwrap();
    let context = dir.path().join(".orchestra");
    std::fs::create_dir_all(context.join("wiki")).unwrap();
    std::fs::write(context.join("rules.md"), "Never commit secrets.").unwrap();
    std::fs::write(context.join("wiki").join("api.md"), "Handlers live in src/api.").unwrap();
    dir
}

fn controller(dir: &TempDir, profiles: Vec<ProfileConfig>) -> IterationController {
    let registry = ProfileRegistry::from_config(&ExecutorConfig {
        default_command: None,
        profiles,
    });
    let context = Arc::new(ProjectContext::new(dir.path()));
    let scheduler = Scheduler::new(
        Arc::new(CommandExecutor::new(registry, dir.path())),
        context.clone(),
        SchedulerConfig {
            max_parallel: 2,
            task_timeout: Duration::from_secs(30),
        },
        ErrorRecoveryManager::new(RetryPolicy::no_retry()),
    );
    IterationController::new(
        "Add a login endpoint",
        Arc::new(PlanFilePlanner::new(dir.path().join("plan.toml"))),
        Arc::new(AllTasksCompleted),
        context,
        scheduler,
    )
    .with_snapshot_path(dir.path().join(".orchestra").join("state.json"))
}

#[tokio::test]
async fn test_plan_file_runs_to_completion() {
    let dir = project();
    let mut ctl = controller(
        &dir,
        vec![recording_profile("backend"), recording_profile("writer")],
    );

    let summary = ctl.run().await.unwrap();

    assert_eq!(summary.status, RunStatus::Stopped(StopReason::ObjectiveMet));
    assert_eq!(summary.completed, 3);
    let order: Vec<String> = summary.records.iter().map(|r| r.task_id.to_string()).collect();
    assert_eq!(order, vec!["schema", "endpoint", "docs"]);

    assert_eq!(
        ctl.graph().get(&id("endpoint")).unwrap().status,
        TaskStatus::Completed
    );
    assert_eq!(summary.records[1].output, "backend done");

    let prompts = std::fs::read_to_string(dir.path().join("prompts.log")).unwrap();
    let blocks: Vec<&str> = prompts.split("\n===\n").filter(|b| !b.is_empty()).collect();
    assert_eq!(blocks.len(), 3);
    assert!(blocks[0].starts_with("Task schema: Create the users table"));
    assert!(blocks[0].contains("Only modify: migrations/"));
    assert!(blocks[1].contains("Never commit secrets."));
    assert!(blocks[1].contains("Handlers live in src/api."));
    assert!(!blocks[0].contains("Handlers live in src/api."));

    assert!(dir.path().join(".orchestra").join("state.json").exists());
}

#[tokio::test]
async fn test_missing_profile_holds_with_validation_failure() {
    let dir = project();
    let mut ctl = controller(&dir, vec![recording_profile("backend")]);

    let summary = ctl.run().await.unwrap();

    assert_eq!(summary.status, RunStatus::Holding(HoldReason::TaskFailures));
    assert_eq!(summary.completed, 2);
    let failure = &summary.failures[0];
    assert_eq!(failure.task, id("docs"));
    assert_eq!(failure.kind, Some(ErrorKind::Validation));
    assert!(failure.detail.contains("writer"));
}

/// Given a run that held because the writer profile was missing
/// When the profile is added and the saved state is resumed in a new process
/// Then only the failed task runs again and the run stops
#[tokio::test]
async fn test_held_run_resumes_from_saved_state() {
    let dir = project();
    let state = dir.path().join(".orchestra").join("state.json");
    let mut first = controller(&dir, vec![recording_profile("backend")]);
    let held = first.run().await.unwrap();
    assert!(held.is_holding());
    drop(first);

    let graph = TaskGraph::from_snapshot(GraphSnapshot::load(&state).unwrap()).unwrap();
    assert_eq!(graph.get(&id("docs")).unwrap().status, TaskStatus::Failed);
    let mut second = controller(
        &dir,
        vec![recording_profile("backend"), recording_profile("writer")],
    )
    .with_held_graph(graph);

    let summary = second.resume().await.unwrap();

    assert_eq!(summary.status, RunStatus::Stopped(StopReason::ObjectiveMet));
    assert_eq!(summary.completed, 3);
    let rerun: Vec<String> = summary.records.iter().map(|r| r.task_id.to_string()).collect();
    assert_eq!(rerun, vec!["docs"]);

    let prompts = std::fs::read_to_string(dir.path().join("prompts.log")).unwrap();
    let blocks: Vec<&str> = prompts.split("\n===\n").filter(|b| !b.is_empty()).collect();
    assert_eq!(blocks.len(), 3);
    assert!(blocks[2].starts_with("Task docs: Document the endpoint"));

    let saved = GraphSnapshot::load(&state).unwrap();
    assert!(saved.all_completed());
}
