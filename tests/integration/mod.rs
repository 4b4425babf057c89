//! Integration test suite for orchestra.
//!
//! These tests drive the scheduler and iteration controller through
//! scripted executors, in-memory checkpoints and temporary git
//! repositories.
//!
//! # Test Categories
//!
//! - `scheduling`: Dependency order, parallelism and resource scopes
//! - `recovery`: Retry backoff, failure classification and rollback
//! - `controller`: Iteration loop outcomes and operator resume
//! - `end_to_end`: Plan files run through real child processes
//! - `property`: Scheduling invariants over generated graphs
//!
//! # CI Compatibility
//!
//! Most tests run on tokio's paused clock, so retry delays and timeouts
//! cost no wall time. Nothing calls out to a network or an agent CLI.

mod fixtures;

mod scheduling;
mod end_to_end;
mod property;
