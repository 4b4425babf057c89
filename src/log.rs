//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! Priority for determining the filter:
//! 1. `--log-level` CLI flag (or `log_level` in the config file)
//! 2. `ORCHESTRA_LOG` environment variable (a level or a directive list)
//! 3. debug when `--debug` is passed or `ORCHESTRA_DEBUG=1`
//! 4. info
//!
//! Output goes to `~/.orchestra/orchestra.log`, truncated on startup. When
//! that file cannot be created, logs go to stderr.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

pub const ENV_LOG: &str = "ORCHESTRA_LOG";
pub const ENV_DEBUG: &str = "ORCHESTRA_DEBUG";

/// Initialize logging at the default level.
pub fn init() {
    init_with_debug(false, None);
}

/// Initialize logging with explicit debug mode and level override.
///
/// Calling this more than once is harmless; only the first call installs a
/// subscriber.
pub fn init_with_debug(debug: bool, level: Option<&str>) {
    let env_debug = std::env::var(ENV_DEBUG)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let filter = resolve_filter(level, std::env::var(ENV_LOG).ok(), debug || env_debug);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false);

    match open_log_file() {
        Some(file) => {
            let _ = builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        None => {
            let _ = builder.with_writer(std::io::stderr).try_init();
        }
    }
}

/// Path of the log file, if a home directory exists.
pub fn log_path() -> Option<PathBuf> {
    Config::orchestra_dir().ok().map(|d| d.join("orchestra.log"))
}

fn open_log_file() -> Option<File> {
    let path = log_path()?;
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).ok()?;
    }
    File::create(path).ok()
}

/// Build the filter from the sources in priority order.
pub fn resolve_filter(cli_level: Option<&str>, env: Option<String>, debug: bool) -> EnvFilter {
    if let Some(level) = cli_level.and_then(parse_level) {
        return EnvFilter::new(level.as_str().to_lowercase());
    }
    if let Some(directives) = env.filter(|s| !s.trim().is_empty()) {
        if let Some(level) = parse_level(&directives) {
            return EnvFilter::new(level.as_str().to_lowercase());
        }
        if let Ok(filter) = EnvFilter::try_new(directives.trim()) {
            return filter;
        }
    }
    let level = if debug { Level::DEBUG } else { Level::INFO };
    EnvFilter::new(level.as_str().to_lowercase())
}

pub fn parse_level(s: &str) -> Option<Level> {
    match s.trim().to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}
