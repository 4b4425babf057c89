//! Core domain models for orchestration.
//!
//! Tasks, per-attempt execution records, and the validated dependency graph.

pub mod graph;
pub mod record;
pub mod task;

pub use graph::{GraphSnapshot, StatusCounts, TaskGraph, Unsatisfiable};
pub use record::{Classification, ErrorKind, ExecutionOutcome, ExecutionRecord};
pub use task::{Task, TaskId, TaskResult, TaskStatus};
