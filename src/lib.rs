pub mod config;
pub mod core;
pub mod error;
pub mod git;
pub mod log;
pub mod orchestration;
pub mod preflight;

pub use error::{Error, Result};
pub use orchestration::{IterationController, RunStatus, RunSummary, Scheduler};
