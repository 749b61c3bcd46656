//! File store persistence tests.
//!
//! These tests verify that a run's state survives closing and reopening
//! the store file, the way the CLI uses it between invocations, and that
//! handles opened on one file concurrently still grant a single owner.

use std::sync::Arc;

use tempfile::TempDir;

use concord::config::{BudgetConfig, Config};
use concord::{Error, FileStore, Run, Task, TaskId, TaskStatus, TaskStore};

use crate::fixtures::{finding, test_config};

fn open(dir: &TempDir) -> (Arc<FileStore>, Run) {
    let store = Arc::new(FileStore::open(dir.path().join("store.json")).unwrap());
    let config = Config {
        budget: BudgetConfig {
            ceiling: Some(100),
            ..BudgetConfig::default()
        },
        ..test_config()
    };
    let run = Run::new(store.clone(), config).unwrap();
    (store, run)
}

/// Test: State survives reopen
/// Given a run with a claimed task, a worker and recorded spending
/// When the store file is reopened
/// Then tasks, workers, ledger and run state are all restored
#[test]
fn test_reopen_restores_run() {
    let dir = TempDir::new().unwrap();
    let worker = {
        let (_store, run) = open(&dir);
        run.submit_all(vec![Task::new("a", "A"), Task::new("b", "B").with_dependency("a")])
            .unwrap();
        let w = run.pool().register("coder").unwrap().id;
        run.coordinator().claim(&TaskId::from("a"), w).unwrap();
        run.governor().record(w, &TaskId::from("a"), 7).unwrap();
        w
    };

    let (store, run) = open(&dir);
    let a = store.read(&TaskId::from("a")).unwrap();
    assert_eq!(a.status, TaskStatus::Claimed);
    assert_eq!(a.owner, Some(worker));
    assert_eq!(run.pool().get(&worker).unwrap().current_task, Some(TaskId::from("a")));
    assert_eq!(run.budget().unwrap().spent, 7);
    assert_eq!(run.budget().unwrap().ceiling, Some(100));

    run.coordinator().start(&TaskId::from("a"), worker).unwrap();
    run.coordinator()
        .complete_with_output(&TaskId::from("a"), worker, finding("a", "done", 1.0))
        .unwrap();
    assert_eq!(
        run.coordinator().eligible_tasks().unwrap()[0].id,
        TaskId::from("b")
    );
}

/// Test: Cycle check survives reopen
/// Given a -> b persisted
/// When b -> a is submitted after reopening
/// Then it is rejected and nothing is written
#[test]
fn test_cycle_check_after_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let (_store, run) = open(&dir);
        run.submit(Task::new("a", "A").with_dependency("b")).unwrap();
    }
    let (store, run) = open(&dir);
    assert!(matches!(
        run.submit(Task::new("b", "B").with_dependency("a")),
        Err(Error::Cycle { .. })
    ));
    drop(run);
    drop(store);

    let (store, _run) = open(&dir);
    assert_eq!(store.list_tasks().unwrap().len(), 1);
}

/// Test: Two handles on one file keep a single owner
/// Given two store handles opened on the same file, each with its own
/// registered worker
/// When both claim the same task
/// Then the second claim loses to the first, and the file keeps both
/// workers and the winning claim
#[test]
fn test_two_handles_claim_once() {
    let dir = TempDir::new().unwrap();
    let (_first_store, first) = open(&dir);
    let (_second_store, second) = open(&dir);
    first.submit(Task::new("a", "A")).unwrap();
    let w1 = first.pool().register("coder").unwrap().id;
    let w2 = second.pool().register("coder").unwrap().id;

    assert!(first.coordinator().claim(&TaskId::from("a"), w1).is_ok());
    match second.coordinator().claim(&TaskId::from("a"), w2) {
        Err(Error::AlreadyClaimed { owner, .. }) => assert_eq!(owner, w1),
        other => panic!("expected AlreadyClaimed, got {:?}", other),
    }

    let (store, run) = open(&dir);
    let a = store.read(&TaskId::from("a")).unwrap();
    assert_eq!(a.owner, Some(w1));
    assert_eq!(store.list_workers().unwrap().len(), 2);
    assert_eq!(run.pool().get(&w1).unwrap().current_task, Some(TaskId::from("a")));
    assert!(run.pool().get(&w2).unwrap().current_task.is_none());
}

/// Test: Racing handles on one file
/// Given four handles on the same file, each on its own thread
/// When they all claim one task at once
/// Then exactly one succeeds and the file names that worker as owner
#[test]
fn test_racing_handles_have_one_winner() {
    let dir = TempDir::new().unwrap();
    {
        let (_store, run) = open(&dir);
        run.submit(Task::new("a", "A")).unwrap();
    }

    let results: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let dir = &dir;
                s.spawn(move || {
                    let (_store, run) = open(dir);
                    let worker = run.pool().register("coder").unwrap().id;
                    (worker, run.coordinator().claim(&TaskId::from("a"), worker))
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let winners: Vec<_> = results.iter().filter(|(_, r)| r.is_ok()).collect();
    assert_eq!(winners.len(), 1);
    for (_, result) in &results {
        if let Err(e) = result {
            assert!(matches!(e, Error::AlreadyClaimed { .. }), "unexpected {:?}", e);
        }
    }

    let (store, _run) = open(&dir);
    assert_eq!(store.read(&TaskId::from("a")).unwrap().owner, Some(winners[0].0));
    assert_eq!(store.list_workers().unwrap().len(), 4);
}
