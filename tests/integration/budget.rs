//! Cost governance tests.
//!
//! These tests verify that the budget ceiling stops new claims without
//! touching work already in flight, that the near-limit checkpoint needs an
//! acknowledgement, and that worker loops wait out a refusal.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use concord::config::{BudgetConfig, Config};
use concord::orchestration::{BudgetStatus, LoopExit, RunEvent};
use concord::{Error, MemoryStore, Run, Task, TaskId, TaskStatus, TaskStore};

use crate::fixtures::{finding, test_config, Harness, Script, ScriptedExecutor};

fn with_ceiling(ceiling: u64) -> Config {
    Config {
        budget: BudgetConfig {
            ceiling: Some(ceiling),
            ..BudgetConfig::default()
        },
        ..test_config()
    }
}

/// Test: Over budget refuses new claims only
/// Given a ceiling of 10 units, fully spent by an in-flight task
/// When that task completes and another claim is attempted
/// Then the completion succeeds and the claim is refused until the ceiling
/// is raised
#[test]
fn test_over_budget_refuses_claims_until_reconfigured() {
    let h = Harness::with_config(with_ceiling(10));
    h.run
        .submit_all(vec![Task::new("a", "A"), Task::new("b", "B")])
        .unwrap();
    let w = h.register("coder");
    let coord = h.run.coordinator();
    let a = TaskId::from("a");

    coord.claim(&a, w).unwrap();
    coord.start(&a, w).unwrap();
    h.run.governor().record(w, &a, 10).unwrap();
    assert_eq!(h.run.budget().unwrap().status, BudgetStatus::OverBudget);

    coord
        .complete_with_output(&a, w, finding("a", "done", 1.0))
        .unwrap();
    assert!(matches!(
        coord.claim(&TaskId::from("b"), w),
        Err(Error::BudgetExceeded {
            spent: 10,
            ceiling: 10
        })
    ));
    assert_eq!(h.task("b").status, TaskStatus::Pending);

    let report = h.run.set_ceiling(Some(100)).unwrap();
    assert_eq!(report.status, BudgetStatus::WithinBudget);
    assert!(coord.claim(&TaskId::from("b"), w).is_ok());
    assert_eq!(h.run.budget().unwrap().per_worker.get(&w), Some(&10));
}

/// Test: Near-limit checkpoint
/// Given spending at 80% of the ceiling
/// When a claim is attempted before and after acknowledging the checkpoint
/// Then it is refused first and admitted after
#[test]
fn test_near_limit_needs_checkpoint() {
    let h = Harness::with_config(with_ceiling(10));
    h.run
        .submit_all(vec![Task::new("a", "A"), Task::new("b", "B")])
        .unwrap();
    let w = h.register("coder");
    h.finish("a", w, finding("a", "done", 1.0));
    h.run.governor().record(w, &TaskId::from("a"), 8).unwrap();

    assert!(matches!(
        h.run.coordinator().claim(&TaskId::from("b"), w),
        Err(Error::CheckpointRequired { .. })
    ));
    let report = h.run.acknowledge_checkpoint().unwrap();
    assert!(report.checkpoint_cleared);
    assert!(h.run.coordinator().claim(&TaskId::from("b"), w).is_ok());
}

/// Test: Ceiling in the store wins over config
/// Given a store whose run already has a ceiling
/// When a run is opened with a different configured ceiling
/// Then the stored ceiling is kept
#[test]
fn test_stored_ceiling_survives_config() {
    let store = Arc::new(MemoryStore::new());
    Run::new(store.clone(), with_ceiling(10)).unwrap();
    let reopened = Run::new(store.clone(), with_ceiling(99)).unwrap();
    assert_eq!(reopened.budget().unwrap().ceiling, Some(10));
}

/// Test: Worker loop waits out a budget refusal
/// Given a ceiling that the first task exhausts
/// When a worker loop runs and the ceiling is later lifted
/// Then the loop pauses, reports the threshold, and drains once lifted
#[tokio::test]
async fn test_worker_loop_waits_for_budget() {
    let store = Arc::new(MemoryStore::new());
    let (run, mut events) = Run::with_events(store.clone(), with_ceiling(5)).unwrap();
    run.submit_all(vec![Task::new("a", "A"), Task::new("b", "B")])
        .unwrap();
    let executor = Arc::new(
        ScriptedExecutor::new()
            .script("a", Script::Output(finding("a", "done", 1.0), 5))
            .script("b", Script::Output(finding("b", "done", 1.0), 5)),
    );
    let handle = run
        .spawn_worker("coder", executor.clone(), CancellationToken::new())
        .unwrap();

    for _ in 0..400 {
        if store.read(&TaskId::from("a")).unwrap().status == TaskStatus::Complete {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        store.read(&TaskId::from("b")).unwrap().status,
        TaskStatus::Pending
    );
    assert_eq!(executor.runs("b"), 0);

    run.set_ceiling(None).unwrap();
    let summary = handle.await.unwrap().unwrap();
    assert_eq!(summary.exit, LoopExit::Drained);
    assert_eq!(summary.completed.len(), 2);

    let mut saw_threshold = false;
    while let Ok(event) = events.try_recv() {
        if let RunEvent::BudgetThreshold {
            status: BudgetStatus::OverBudget,
            ..
        } = event
        {
            saw_threshold = true;
        }
    }
    assert!(saw_threshold);
}
