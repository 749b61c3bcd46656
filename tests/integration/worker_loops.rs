//! Worker loop tests.
//!
//! These tests run several worker loops concurrently against one store and
//! verify that every task is executed exactly once, in dependency order,
//! with the run supervised alongside.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use concord::orchestration::LoopExit;
use concord::{Task, TaskStatus, TaskStore};

use crate::fixtures::{diamond, independent_tasks, Harness, Script, ScriptedExecutor};

/// Test: Parallel loops execute each task once
/// Given 12 independent tasks plus a diamond, and 4 worker loops
/// When the loops run on a multi-threaded runtime under supervision
/// Then every task completes, each executed exactly once
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_loops_execute_each_task_once() {
    let h = Harness::new();
    let mut tasks = independent_tasks(12);
    tasks.extend(diamond());
    let ids: Vec<String> = tasks.iter().map(|t| t.id.to_string()).collect();
    h.run.submit_all(tasks).unwrap();

    let executor = Arc::new(ScriptedExecutor::new());
    let cancel = CancellationToken::new();
    let handles: Vec<_> = (0..4)
        .map(|i| {
            h.run
                .spawn_worker(&format!("w{}", i), executor.clone(), cancel.clone())
                .unwrap()
        })
        .collect();

    h.run
        .supervise(Duration::from_millis(10), cancel.clone())
        .await
        .unwrap();

    let mut completed = 0;
    for handle in handles {
        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.exit, LoopExit::Drained);
        completed += summary.completed.len();
    }
    assert_eq!(completed, ids.len());
    for id in &ids {
        assert_eq!(executor.runs(id), 1, "task {} ran more than once", id);
        assert_eq!(h.task(id).status, TaskStatus::Complete);
    }

    let d = h.task("d");
    let b = h.task("b");
    let c = h.task("c");
    assert!(d.claimed_at.unwrap() >= b.finished_at.unwrap());
    assert!(d.claimed_at.unwrap() >= c.finished_at.unwrap());

    assert!(h.run.pool().active_workers().unwrap().is_empty());
    assert!(h.run.synthesize().unwrap().succeeded());
}

/// Test: Failed execution is retried by another worker
/// Given a task whose execution fails for the first worker only
/// When two loops run
/// Then the task is released, completed by the other worker, and the
/// failure is counted
#[tokio::test]
async fn test_failed_execution_is_released_for_retry() {
    let h = Harness::new();
    h.run.submit(Task::new("a", "A")).unwrap();

    let failing = Arc::new(ScriptedExecutor::new().script("a", Script::Fail("oom".into())));
    let first = h
        .run
        .spawn_worker("flaky", failing.clone(), CancellationToken::new())
        .unwrap();

    for _ in 0..400 {
        if failing.runs("a") > 0 && h.task("a").status == TaskStatus::Pending {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let healthy = Arc::new(ScriptedExecutor::new());
    let second = h
        .run
        .spawn_worker("steady", healthy.clone(), CancellationToken::new())
        .unwrap();

    let second = second.await.unwrap().unwrap();
    let first = first.await.unwrap().unwrap();
    assert_eq!(h.task("a").status, TaskStatus::Complete);
    assert_eq!(healthy.runs("a"), 1);
    assert!(first.failures >= 1);
    assert!(second.completed.len() + first.completed.len() == 1);
    assert!(h
        .store
        .list_workers()
        .unwrap()
        .iter()
        .all(|w| w.is_removed()));
}
