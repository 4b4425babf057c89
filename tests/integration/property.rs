//! Scheduling invariants over randomly generated task graphs.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use orchestra::core::{Task, TaskGraph, TaskStatus};
use orchestra::orchestration::{ErrorRecoveryManager, RetryPolicy};

use crate::fixtures::{scheduler, task, ScriptedExecutor};

const SCOPES: [&str; 4] = ["src/", "src/lib.rs", "docs/", "tests/**/*.rs"];

/// Per task: which lower-numbered tasks it depends on, an optional scope
/// and a duration in milliseconds.
fn graph_strategy() -> impl Strategy<Value = Vec<(Vec<bool>, Option<usize>, u64)>> {
    prop::collection::vec(
        (
            prop::collection::vec(any::<bool>(), 8),
            prop::option::of(0..SCOPES.len()),
            1u64..4,
        ),
        1..8,
    )
}

fn build(shape: &[(Vec<bool>, Option<usize>, u64)]) -> Vec<Task> {
    shape.iter()
        .enumerate()
        .map(|(i, (deps, scope, _))| {
            let deps: Vec<String> = (0..i).filter(|j| deps[*j]).map(|j| format!("t{}", j)).collect();
            let t = task(&format!("t{}", i)).depends_on(deps);
            match scope {
                Some(s) => t.with_scope([SCOPES[*s]]),
                None => t,
            }
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_drain_respects_dependencies_scopes_and_capacity(
        shape in graph_strategy(),
        max_parallel in 1usize..4,
    ) {
        let tasks = build(&shape);
        let executor = shape.iter().enumerate().fold(ScriptedExecutor::new(), |ex, (i, (_, _, ms))| {
            ex.duration(&format!("t{}", i), Duration::from_millis(*ms))
        });
        let executor = Arc::new(executor);
        let mut sched = scheduler(
            executor.clone(),
            max_parallel,
            ErrorRecoveryManager::new(RetryPolicy::default()),
        );
        let mut graph = TaskGraph::new(tasks.clone(), 1).unwrap();

        let report = tokio_test::block_on(sched.drain(&mut graph)).unwrap();

        prop_assert_eq!(report.counts.completed, tasks.len());
        prop_assert!(graph.tasks().all(|t| t.status == TaskStatus::Completed));
        prop_assert!(executor.peak_concurrency() <= max_parallel);
        prop_assert!(executor.scope_violations().is_empty());
        prop_assert!(sched.lock().is_empty());

        for t in &tasks {
            let child = &executor.spans_of(t.id.as_str())[0];
            for dep in &t.dependencies {
                let parent = &executor.spans_of(dep.as_str())[0];
                prop_assert!(
                    child.start_seq > parent.end_seq,
                    "{} started before {} finished", t.id, dep
                );
            }
        }
    }
}
