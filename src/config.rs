use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::core::record::ErrorKind;
use crate::{Error, Result};

pub const ENV_MAX_PARALLEL: &str = "ORCHESTRA_MAX_PARALLEL";
pub const ENV_MAX_ITERATIONS: &str = "ORCHESTRA_MAX_ITERATIONS";
pub const ENV_TASK_TIMEOUT: &str = "ORCHESTRA_TASK_TIMEOUT";
pub const ENV_AUTO_ROLLBACK: &str = "ORCHESTRA_AUTO_ROLLBACK";

/// Project-local config file name.
pub const PROJECT_CONFIG_FILE: &str = ".orchestra.toml";

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub execution: ExecutionConfig,
    pub retry: RetryConfig,
    pub rollback: RollbackConfig,
    pub executor: ExecutorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutionConfig {
    pub max_parallel: usize,
    pub max_iterations: u32,
    pub task_timeout_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_parallel: 3,
            max_iterations: 10,
            task_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first run; 3 allows up to 4 runs.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_backoff_secs: u64,
    pub retry_on: Vec<ErrorKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            backoff_factor: 2.0,
            max_backoff_secs: 300,
            retry_on: vec![ErrorKind::Timeout, ErrorKind::Network, ErrorKind::Transient],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RollbackConfig {
    pub enabled: bool,
    pub create_checkpoints: bool,
    pub keep_checkpoints: usize,
    pub auto_rollback: bool,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            create_checkpoints: true,
            keep_checkpoints: 10,
            auto_rollback: false,
        }
    }
}

impl RollbackConfig {
    /// Whether checkpoints are taken at all.
    pub fn checkpoints_active(&self) -> bool {
        self.enabled && self.create_checkpoints
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Command used for assignees with no profile of their own.
    pub default_command: Option<Vec<String>>,
    pub profiles: Vec<ProfileConfig>,
}

/// A named execution profile: the command line a task's assignee maps to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProfileConfig {
    pub name: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Config {
    pub fn orchestra_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".orchestra"))
    }

    pub fn global_config_path() -> Result<PathBuf> {
        Ok(Self::orchestra_dir()?.join("config.toml"))
    }

    pub fn project_config_path(project_dir: &Path) -> PathBuf {
        project_dir.join(PROJECT_CONFIG_FILE)
    }

    /// Config file that [`Config::load`] would read, if any.
    pub fn resolve_path(explicit: Option<&Path>, project_dir: &Path) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        let project = Self::project_config_path(project_dir);
        if project.exists() {
            return Some(project);
        }
        Self::global_config_path().ok().filter(|p| p.exists())
    }

    /// Load config: explicit path, then the project file, then the global
    /// file, then defaults. Environment overrides are applied on top.
    pub fn load(explicit: Option<&Path>, project_dir: &Path) -> Result<Self> {
        let mut config = match Self::resolve_path(explicit, project_dir) {
            Some(path) => Self::from_file(&path)?,
            None => {
                debug!("No config file found, using defaults");
                Self::default()
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Loading config");
        if !path.exists() {
            return Err(Error::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        Ok(config)
    }

    /// Apply `ORCHESTRA_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_MAX_PARALLEL) {
            self.execution.max_parallel = parse_env(ENV_MAX_PARALLEL, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_ITERATIONS) {
            self.execution.max_iterations = parse_env(ENV_MAX_ITERATIONS, &v)?;
        }
        if let Some(v) = lookup(ENV_TASK_TIMEOUT) {
            self.execution.task_timeout_secs = parse_env(ENV_TASK_TIMEOUT, &v)?;
        }
        if let Some(v) = lookup(ENV_AUTO_ROLLBACK) {
            self.rollback.auto_rollback = parse_bool(ENV_AUTO_ROLLBACK, &v)?;
        }
        Ok(())
    }

    /// Check every setting; all violations are reported together.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.execution.max_parallel < 1 {
            problems.push("execution.max_parallel must be at least 1".to_string());
        }
        if self.execution.max_iterations < 1 {
            problems.push("execution.max_iterations must be at least 1".to_string());
        }
        if self.execution.task_timeout_secs < 1 {
            problems.push("execution.task_timeout_secs must be at least 1".to_string());
        }
        if self.retry.max_attempts < 1 {
            problems.push("retry.max_attempts must be at least 1".to_string());
        }
        if !(self.retry.backoff_factor >= 1.0) {
            problems.push("retry.backoff_factor must be at least 1.0".to_string());
        }
        if self.rollback.keep_checkpoints < 1 {
            problems.push("rollback.keep_checkpoints must be at least 1".to_string());
        }
        if let Some(level) = &self.log_level {
            if crate::log::parse_level(level).is_none() {
                problems.push(format!("log_level '{}' is not a valid level", level));
            }
        }

        let mut names = HashSet::new();
        for profile in &self.executor.profiles {
            if !names.insert(profile.name.as_str()) {
                problems.push(format!("executor profile '{}' is defined twice", profile.name));
            }
            if profile.command.is_empty() {
                problems.push(format!("executor profile '{}' has an empty command", profile.name));
            }
        }
        if self
            .executor
            .default_command
            .as_ref()
            .is_some_and(|c| c.is_empty())
        {
            problems.push("executor.default_command is empty".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(problems.join("; ")))
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "Config saved");
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{} has invalid value '{}'", key, value)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!("{} has invalid value '{}'", key, value))),
    }
}
