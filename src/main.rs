use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};

use orchestra::config::Config;
use orchestra::core::{GraphSnapshot, TaskGraph};
use orchestra::git::GitCheckpointBackend;
use orchestra::orchestration::{
    AllTasksCompleted, CheckpointStore, CommandExecutor, ErrorRecoveryManager,
    IterationController, PlanFile, PlanFilePlanner, ProfileRegistry, ProjectContext, RetryPolicy,
    RunSummary, Scheduler, SchedulerConfig, SchedulerEvent, CONTEXT_DIR,
};
use orchestra::preflight::{self, ValidationReport};
use orchestra::{Error, Result};

/// Exit code for a run that ended HOLDING.
const EXIT_HOLDING: i32 = 2;
/// Exit code for failed pre-flight validation.
const EXIT_INVALID: i32 = 1;

/// Orchestra - dependency-aware task orchestration engine
#[derive(Parser, Debug)]
#[command(name = "orchestra")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    ORCHESTRA_DEBUG=1        Enable debug logging (alternative to --debug)\n    ORCHESTRA_LOG=<filter>   Log level or filter directives\n    ORCHESTRA_MAX_PARALLEL, ORCHESTRA_MAX_ITERATIONS,\n    ORCHESTRA_TASK_TIMEOUT, ORCHESTRA_AUTO_ROLLBACK   Override config values"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.orchestra/orchestra.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Config file (defaults to .orchestra.toml, then ~/.orchestra/config.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run a plan until the objective is met or the run holds
    Run {
        /// Plan file (TOML or JSON)
        #[arg(short, long)]
        plan: PathBuf,

        /// Objective text (defaults to the plan's objective)
        #[arg(short, long)]
        objective: Option<String>,

        /// Project directory (defaults to the current directory)
        #[arg(long)]
        project_dir: Option<PathBuf>,

        /// Maximum concurrently running tasks
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Iteration budget
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Restore the last checkpoint when a task fails terminally
        /// (turns rollback on if the config disables it)
        #[arg(long)]
        auto_rollback: bool,

        /// Continue the held run saved in .orchestra/state.json
        #[arg(long)]
        resume: bool,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check the project, config, and optionally a plan without running
    Validate {
        /// Project directory (defaults to the current directory)
        #[arg(long)]
        project_dir: Option<PathBuf>,

        /// Plan file to check
        #[arg(short, long)]
        plan: Option<PathBuf>,
    },

    /// Show or create configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show {
        /// Project directory (defaults to the current directory)
        #[arg(long)]
        project_dir: Option<PathBuf>,
    },
    /// Write a default config file
    Init {
        /// Write ~/.orchestra/config.toml instead of the project file
        #[arg(long)]
        global: bool,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.clone() {
        Command::Run {
            plan,
            objective,
            project_dir,
            max_parallel,
            max_iterations,
            auto_rollback,
            resume,
            json,
        } => {
            let project_dir = resolve_project_dir(project_dir)?;
            let mut config = Config::load(cli.config.as_deref(), &project_dir)?;
            init_logging(&cli, &config);
            apply_run_overrides(&mut config, max_parallel, max_iterations, auto_rollback);

            let mut report = preflight::validate(&project_dir, &config);
            preflight::check_plan(&mut report, &plan);
            if !report.is_ok() {
                print_report(&report);
                std::process::exit(EXIT_INVALID);
            }
            for warning in &report.warnings {
                eprintln!("warning: {}", warning);
            }

            let runtime = tokio::runtime::Runtime::new()?;
            let summary = runtime.block_on(run_plan(
                config,
                project_dir,
                plan,
                objective,
                RunMode { resume, quiet: json },
            ))?;

            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print!("{}", format_summary(&summary));
            }
            if summary.is_holding() {
                std::process::exit(EXIT_HOLDING);
            }
            Ok(())
        }
        Command::Validate { project_dir, plan } => {
            let project_dir = resolve_project_dir(project_dir)?;
            let config = Config::load(cli.config.as_deref(), &project_dir)?;
            init_logging(&cli, &config);

            let mut report = preflight::validate(&project_dir, &config);
            if let Some(plan) = plan {
                preflight::check_plan(&mut report, &plan);
            }
            print_report(&report);
            if !report.is_ok() {
                std::process::exit(EXIT_INVALID);
            }
            Ok(())
        }
        Command::Config { action } => run_config(&cli, action),
    }
}

fn init_logging(cli: &Cli, config: &Config) {
    let level = cli.log_level.as_deref().or(config.log_level.as_deref());
    orchestra::log::init_with_debug(cli.debug, level);
}

/// Apply `run` flags on top of the loaded config.
fn apply_run_overrides(
    config: &mut Config,
    max_parallel: Option<usize>,
    max_iterations: Option<u32>,
    auto_rollback: bool,
) {
    if let Some(n) = max_parallel {
        config.execution.max_parallel = n;
    }
    if let Some(n) = max_iterations {
        config.execution.max_iterations = n;
    }
    if auto_rollback {
        if !config.rollback.enabled {
            warn!("--auto-rollback given while rollback.enabled = false, enabling rollback");
            eprintln!("warning: --auto-rollback overrides rollback.enabled = false");
            config.rollback.enabled = true;
        }
        config.rollback.auto_rollback = true;
    }
}

fn state_path(project_dir: &Path) -> PathBuf {
    project_dir.join(CONTEXT_DIR).join("state.json")
}

/// Rebuild the graph of a held run from its saved state.
fn load_held_graph(path: &Path) -> Result<TaskGraph> {
    GraphSnapshot::load(path)
        .and_then(TaskGraph::from_snapshot)
        .map_err(|e| Error::Validation(format!("cannot resume from {}: {}", path.display(), e)))
}

#[derive(Debug, Clone, Copy)]
struct RunMode {
    resume: bool,
    quiet: bool,
}

fn resolve_project_dir(dir: Option<PathBuf>) -> Result<PathBuf> {
    let dir = match dir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    Ok(dir.canonicalize().unwrap_or(dir))
}

async fn run_plan(
    config: Config,
    project_dir: PathBuf,
    plan: PathBuf,
    objective: Option<String>,
    mode: RunMode,
) -> Result<RunSummary> {
    let held = if mode.resume {
        Some(load_held_graph(&state_path(&project_dir))?)
    } else {
        None
    };

    let objective = match objective {
        Some(objective) => objective,
        None => PlanFile::load(&plan)?
            .objective
            .unwrap_or_else(|| format!("Complete every task in {}", plan.display())),
    };
    info!(%objective, project = %project_dir.display(), "Starting run");

    let mut recovery = ErrorRecoveryManager::new(RetryPolicy::from(&config.retry))
        .with_auto_rollback(config.rollback.enabled && config.rollback.auto_rollback);
    if config.rollback.checkpoints_active() {
        let backend = GitCheckpointBackend::new(&project_dir)?;
        recovery = recovery.with_checkpoints(CheckpointStore::new(
            Arc::new(backend),
            config.rollback.keep_checkpoints,
        ));
    }

    let executor = CommandExecutor::new(
        ProfileRegistry::from_config(&config.executor),
        project_dir.clone(),
    );
    let context = Arc::new(ProjectContext::new(&project_dir));
    let (event_tx, event_rx) = mpsc::channel(256);
    let scheduler = Scheduler::new(
        Arc::new(executor),
        context.clone(),
        SchedulerConfig::from(&config.execution),
        recovery,
    )
    .with_events(event_tx);

    let cancel = scheduler.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight tasks");
            eprintln!("Interrupted: waiting for running tasks to finish...");
            cancel.cancel();
        }
    });
    let progress = tokio::spawn(print_progress(event_rx, mode.quiet));

    let mut controller = IterationController::new(
        &objective,
        Arc::new(PlanFilePlanner::new(plan)),
        Arc::new(AllTasksCompleted),
        context,
        scheduler,
    )
    .with_max_iterations(config.execution.max_iterations)
    .with_snapshot_path(state_path(&project_dir));

    let summary = match held {
        Some(graph) => {
            info!(iteration = graph.iteration(), tasks = graph.len(), "Resuming held run");
            controller = controller.with_held_graph(graph);
            controller.resume().await
        }
        None => controller.run().await,
    };
    drop(controller);
    let _ = progress.await;
    summary
}

async fn print_progress(mut rx: mpsc::Receiver<SchedulerEvent>, quiet: bool) {
    while let Some(event) = rx.recv().await {
        if !quiet {
            eprintln!("{}", format_event(&event));
        }
    }
}

fn format_event(event: &SchedulerEvent) -> String {
    match event {
        SchedulerEvent::TaskStarted { task_id, attempt } => {
            format!("  > {} started (attempt {})", task_id, attempt + 1)
        }
        SchedulerEvent::TaskCompleted { task_id, .. } => format!("  + {} completed", task_id),
        SchedulerEvent::TaskRetrying {
            task_id,
            kind,
            delay,
            ..
        } => format!("  ~ {} failed ({}), retrying in {:?}", task_id, kind, delay),
        SchedulerEvent::TaskFailed {
            task_id,
            kind,
            detail,
        } => format!("  x {} failed ({}): {}", task_id, kind, truncate_string(detail, 120)),
        SchedulerEvent::RolledBack { checkpoint, reset } => format!(
            "  < restored {} (reset {})",
            checkpoint,
            join_ids(reset.iter().map(|id| id.as_str()))
        ),
        SchedulerEvent::Drained { completed, failed } => {
            format!("  = pass finished: {} completed, {} failed", completed, failed)
        }
    }
}

fn format_summary(summary: &RunSummary) -> String {
    let mut out = String::new();
    out.push('\n');
    out.push_str(&format!("Run {}: {}\n", summary.run_id, summary.status));
    out.push_str(&format!("  Objective:  {}\n", summary.objective));
    out.push_str(&format!("  Iterations: {}\n", summary.iterations));
    out.push_str(&format!(
        "  Tasks:      {} total, {} completed, {} failed, {} pending\n",
        summary.total, summary.completed, summary.failed, summary.pending
    ));

    if !summary.failures.is_empty() {
        out.push_str("\nFailures:\n");
        for failure in &summary.failures {
            let kind = failure
                .kind
                .map(|k| k.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            let mut notes = Vec::new();
            if failure.rolled_back {
                notes.push("rolled back");
            } else if failure.checkpoint_available {
                notes.push("checkpoint available");
            }
            out.push_str(&format!(
                "  {} [{}] after {} attempt(s): {}",
                failure.task,
                kind,
                failure.attempts,
                truncate_string(&failure.detail, 200)
            ));
            if !notes.is_empty() {
                out.push_str(&format!(" ({})", notes.join(", ")));
            }
            out.push('\n');
        }
    }

    if !summary.unsatisfiable.is_empty() {
        out.push_str("\nBlocked:\n");
        for u in &summary.unsatisfiable {
            out.push_str(&format!("  {} waits on {}\n", u.task, u.blocked_by));
        }
    }

    if !summary.rollbacks.is_empty() {
        out.push_str("\nRollbacks:\n");
        for r in &summary.rollbacks {
            out.push_str(&format!(
                "  {} after {} (reset {})\n",
                r.checkpoint,
                join_ids(r.triggered_by.iter().map(|id| id.as_str())),
                join_ids(r.reset.iter().map(|id| id.as_str()))
            ));
        }
    }

    if summary.is_holding() {
        out.push_str("\nNext steps:\n");
        out.push_str("  1. Inspect the failures above and fix their cause\n");
        out.push_str("  2. Extend or edit the plan file if needed\n");
        out.push_str("  3. Run `orchestra run --resume` with the same plan to continue\n");
    }
    out
}

fn print_report(report: &ValidationReport) {
    for error in &report.errors {
        println!("error: {}", error);
    }
    for warning in &report.warnings {
        println!("warning: {}", warning);
    }
    for suggestion in &report.suggestions {
        println!("  hint: {}", suggestion);
    }
    if report.is_ok() {
        println!("ok");
    }
}

fn run_config(cli: &Cli, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show { project_dir } => {
            let project_dir = resolve_project_dir(project_dir)?;
            let config = Config::load(cli.config.as_deref(), &project_dir)?;
            if let Some(path) = Config::resolve_path(cli.config.as_deref(), &project_dir) {
                println!("# loaded from {}", path.display());
            }
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        ConfigAction::Init { global, force } => {
            let path = match (&cli.config, global) {
                (Some(path), _) => path.clone(),
                (None, true) => Config::global_config_path()?,
                (None, false) => Config::project_config_path(&std::env::current_dir()?),
            };
            write_default_config(&path, force)
        }
    }
}

fn write_default_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        println!("{} already exists (use --force to overwrite)", path.display());
        return Ok(());
    }
    Config::default().save(path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn join_ids<'a>(ids: impl Iterator<Item = &'a str>) -> String {
    let ids: Vec<&str> = ids.collect();
    if ids.is_empty() {
        "none".to_string()
    } else {
        ids.join(", ")
    }
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
