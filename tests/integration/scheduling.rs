//! Scheduler integration tests: dependency order, bounded parallelism and
//! resource scopes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use orchestra::core::{ErrorKind, TaskGraph, TaskStatus};
use orchestra::orchestration::{ErrorRecoveryManager, RetryPolicy, SchedulerEvent};

use crate::fixtures::{id, scheduler, task, ScriptedExecutor, Step};

/// Given t1, t2 (depends on t1) and t3 with max_parallel 2
/// When the graph is drained
/// Then t1 and t3 start together and t2 starts only after t1 finished
#[tokio::test(start_paused = true)]
async fn test_dependency_order_with_parallelism() {
    let executor = Arc::new(
        ScriptedExecutor::new()
            .duration("t1", Duration::from_millis(100))
            .duration("t3", Duration::from_millis(300)),
    );
    let mut sched = scheduler(
        executor.clone(),
        2,
        ErrorRecoveryManager::new(RetryPolicy::default()),
    );
    let mut graph = TaskGraph::new(
        vec![task("t1"), task("t2").depends_on(["t1"]), task("t3")],
        1,
    )
    .unwrap();

    let report = sched.drain(&mut graph).await.unwrap();

    assert_eq!(report.counts.completed, 3);
    assert_eq!(executor.peak_concurrency(), 2);
    let t1 = &executor.spans_of("t1")[0];
    let t2 = &executor.spans_of("t2")[0];
    let t3 = &executor.spans_of("t3")[0];
    assert_eq!(t1.started, t3.started);
    assert!(t2.started >= t1.finished);
    assert!(t2.start_seq > t1.end_seq);
    // t2 fills the slot t1 freed while t3 is still running.
    assert!(t2.started < t3.finished);
}

#[tokio::test(start_paused = true)]
async fn test_max_parallel_one_runs_sequentially() {
    let executor = Arc::new(ScriptedExecutor::new());
    let mut sched = scheduler(
        executor.clone(),
        1,
        ErrorRecoveryManager::new(RetryPolicy::default()),
    );
    let mut graph = TaskGraph::new(vec![task("a"), task("b"), task("c")], 1).unwrap();

    sched.drain(&mut graph).await.unwrap();

    assert_eq!(executor.peak_concurrency(), 1);
    let order: Vec<String> = executor.spans().iter().map(|s| s.task.to_string()).collect();
    assert_eq!(order, vec!["a", "b", "c"]);
}

/// Given two independent tasks claiming the same directory
/// When drained with plenty of capacity
/// Then they never run at the same time
#[tokio::test(start_paused = true)]
async fn test_overlapping_scopes_are_serialized() {
    let executor = Arc::new(ScriptedExecutor::new().default_duration(Duration::from_millis(50)));
    let mut sched = scheduler(
        executor.clone(),
        4,
        ErrorRecoveryManager::new(RetryPolicy::default()),
    );
    let mut graph = TaskGraph::new(
        vec![
            task("api").with_scope(["src/api"]),
            task("handler").with_scope(["src/api/handlers/login.rs"]),
            task("docs").with_scope(["docs/"]),
        ],
        1,
    )
    .unwrap();

    sched.drain(&mut graph).await.unwrap();

    let api = &executor.spans_of("api")[0];
    let handler = &executor.spans_of("handler")[0];
    let docs = &executor.spans_of("docs")[0];
    assert!(!api.overlaps(handler));
    assert!(api.overlaps(docs));
    assert!(executor.scope_violations().is_empty());
    assert!(sched.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_glob_scope_conflicts_with_literal() {
    let executor = Arc::new(ScriptedExecutor::new().default_duration(Duration::from_millis(50)));
    let mut sched = scheduler(
        executor.clone(),
        4,
        ErrorRecoveryManager::new(RetryPolicy::default()),
    );
    let mut graph = TaskGraph::new(
        vec![
            task("all-rs").with_scope(["src/**/*.rs"]),
            task("lib").with_scope(["src/lib.rs"]),
            task("readme").with_scope(["README.md"]),
        ],
        1,
    )
    .unwrap();

    sched.drain(&mut graph).await.unwrap();

    let all = &executor.spans_of("all-rs")[0];
    let lib = &executor.spans_of("lib")[0];
    let readme = &executor.spans_of("readme")[0];
    assert!(!all.overlaps(lib));
    assert!(all.overlaps(readme));
}

#[tokio::test(start_paused = true)]
async fn test_independent_branch_continues_after_failure() {
    let executor = Arc::new(
        ScriptedExecutor::new().script("bad", vec![Step::Fail(ErrorKind::Validation, "rejected")]),
    );
    let mut sched = scheduler(
        executor.clone(),
        2,
        ErrorRecoveryManager::new(RetryPolicy::default()),
    );
    let mut graph = TaskGraph::new(
        vec![
            task("bad"),
            task("after-bad").depends_on(["bad"]),
            task("good"),
            task("after-good").depends_on(["good"]),
        ],
        1,
    )
    .unwrap();

    let report = sched.drain(&mut graph).await.unwrap();

    assert_eq!(graph.get(&id("bad")).unwrap().status, TaskStatus::Failed);
    assert_eq!(graph.get(&id("after-bad")).unwrap().status, TaskStatus::Pending);
    assert_eq!(graph.get(&id("after-good")).unwrap().status, TaskStatus::Completed);
    assert!(report.stuck);
    assert_eq!(graph.unsatisfiable()[0].blocked_by, id("bad"));
    assert_eq!(executor.attempts("after-bad"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_events_follow_task_lifecycle() {
    let (tx, mut rx) = mpsc::channel(32);
    let executor = Arc::new(ScriptedExecutor::new());
    let mut sched = scheduler(
        executor,
        1,
        ErrorRecoveryManager::new(RetryPolicy::default()),
    )
    .with_events(tx);
    let mut graph = TaskGraph::new(vec![task("t1")], 1).unwrap();

    sched.drain(&mut graph).await.unwrap();
    drop(sched);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    assert_eq!(
        events,
        vec![
            SchedulerEvent::TaskStarted {
                task_id: id("t1"),
                attempt: 0
            },
            SchedulerEvent::TaskCompleted {
                task_id: id("t1"),
                attempt: 0
            },
            SchedulerEvent::Drained {
                completed: 1,
                failed: 0
            },
        ]
    );
}

/// Given a cancelled run
/// When drain is called
/// Then nothing is dispatched and the report says cancelled
#[tokio::test(start_paused = true)]
async fn test_cancelled_before_dispatch() {
    let executor = Arc::new(ScriptedExecutor::new());
    let mut sched = scheduler(
        executor.clone(),
        2,
        ErrorRecoveryManager::new(RetryPolicy::default()),
    );
    sched.cancellation_token().cancel();
    let mut graph = TaskGraph::new(vec![task("t1"), task("t2")], 1).unwrap();

    let report = sched.drain(&mut graph).await.unwrap();

    assert!(report.cancelled);
    assert!(report.records.is_empty());
    assert_eq!(report.counts.ready, 2);
    assert!(executor.spans().is_empty());
}

/// Cancelling mid-run lets in-flight attempts finish but starts nothing new.
#[tokio::test(start_paused = true)]
async fn test_cancel_mid_run_finishes_in_flight() {
    let executor = Arc::new(ScriptedExecutor::new().default_duration(Duration::from_millis(100)));
    let mut sched = scheduler(
        executor.clone(),
        1,
        ErrorRecoveryManager::new(RetryPolicy::default()),
    );
    let token = sched.cancellation_token();
    let mut graph = TaskGraph::new(vec![task("t1"), task("t2")], 1).unwrap();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });
    let report = sched.drain(&mut graph).await.unwrap();

    assert!(report.cancelled);
    assert_eq!(graph.get(&id("t1")).unwrap().status, TaskStatus::Completed);
    assert_eq!(graph.get(&id("t2")).unwrap().status, TaskStatus::Ready);
    assert_eq!(executor.attempts("t2"), 0);
}

/// Given t1 <- t2 <- t3 and a run cancelled while t1 is in flight
/// When t1 finishes
/// Then t2 is Ready in the graph and its snapshot while t3 stays Pending
#[tokio::test(start_paused = true)]
async fn test_dependent_becomes_ready_when_prerequisite_completes() {
    let executor = Arc::new(ScriptedExecutor::new().default_duration(Duration::from_millis(100)));
    let mut sched = scheduler(
        executor,
        2,
        ErrorRecoveryManager::new(RetryPolicy::default()),
    );
    let token = sched.cancellation_token();
    let mut graph = TaskGraph::new(
        vec![
            task("t1"),
            task("t2").depends_on(["t1"]),
            task("t3").depends_on(["t2"]),
        ],
        1,
    )
    .unwrap();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });
    let report = sched.drain(&mut graph).await.unwrap();

    assert!(report.cancelled);
    assert_eq!(report.counts.ready, 1);
    let statuses: Vec<(String, TaskStatus)> = graph
        .snapshot()
        .tasks
        .iter()
        .map(|t| (t.id.to_string(), t.status))
        .collect();
    assert_eq!(
        statuses,
        vec![
            ("t1".to_string(), TaskStatus::Completed),
            ("t2".to_string(), TaskStatus::Ready),
            ("t3".to_string(), TaskStatus::Pending),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_attempt_timeout_is_classified() {
    let executor = Arc::new(ScriptedExecutor::new().duration("slow", Duration::from_secs(60)));
    let mut sched = scheduler(
        executor,
        1,
        ErrorRecoveryManager::new(RetryPolicy::no_retry()),
    );
    let mut graph = TaskGraph::new(vec![task("slow")], 1).unwrap();

    let report = sched.drain(&mut graph).await.unwrap();

    let slow = graph.get(&id("slow")).unwrap();
    assert_eq!(slow.status, TaskStatus::Failed);
    assert_eq!(slow.failure_kind(), Some(ErrorKind::Timeout));
    assert_eq!(report.records[0].error, Some(ErrorKind::Timeout));
}

#[tokio::test(start_paused = true)]
async fn test_worker_panic_releases_lock() {
    let executor = Arc::new(ScriptedExecutor::new().script("boom", vec![Step::Panic]));
    let mut sched = scheduler(
        executor,
        2,
        ErrorRecoveryManager::new(RetryPolicy::default().with_base_delay(Duration::from_millis(5))),
    );
    let mut graph = TaskGraph::new(vec![task("boom").with_scope(["src/"])], 1).unwrap();

    let report = sched.drain(&mut graph).await.unwrap();

    assert_eq!(graph.get(&id("boom")).unwrap().status, TaskStatus::Completed);
    assert_eq!(report.records.len(), 2);
    assert_eq!(report.records[0].error, Some(ErrorKind::Transient));
    assert!(sched.lock().is_empty());
}
