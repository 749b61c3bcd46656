//! Claim race tests.
//!
//! Two workers polling the same store at the same moment must never both
//! own a task: the first compare-and-set wins and the loser sees
//! `AlreadyClaimed` with nothing changed.

use std::sync::Arc;

use concord::orchestration::EscalationAction;
use concord::{Error, Run, Task, TaskId, TaskStatus, TaskStore};

use crate::fixtures::{test_config, Harness, RacingStore};

/// Test: Losing a claim race
/// Given a rival claim lands between eligibility check and write
/// When the worker's compare-and-set runs
/// Then it fails with AlreadyClaimed naming the rival and changes nothing
#[test]
fn test_lost_race_reports_rival_owner() {
    let store = Arc::new(RacingStore::new());
    let run = Run::new(store.clone(), test_config()).unwrap();
    run.submit(Task::new("a", "A")).unwrap();
    let loser = run.pool().register("loser").unwrap().id;
    let rival = run.pool().register("rival").unwrap().id;

    store.arm("a", rival);
    match run.coordinator().claim(&TaskId::from("a"), loser) {
        Err(Error::AlreadyClaimed { owner, .. }) => assert_eq!(owner, rival),
        other => panic!("expected AlreadyClaimed, got {:?}", other),
    }

    let task = store.read(&TaskId::from("a")).unwrap();
    assert_eq!(task.status, TaskStatus::Claimed);
    assert_eq!(task.owner, Some(rival));
    assert!(run.pool().get(&loser).unwrap().current_task.is_none());
    assert_eq!(store.cas_conflicts(&TaskId::from("a")).unwrap().len(), 1);
}

/// Test: Double claim is logged once
/// Given a rejected conflicting write in the store's conflict log
/// When escalation runs twice
/// Then the double claim is logged once and the owner is untouched
#[test]
fn test_double_claim_logged_once() {
    let store = Arc::new(RacingStore::new());
    let run = Run::new(store.clone(), test_config()).unwrap();
    run.submit(Task::new("a", "A")).unwrap();
    let loser = run.pool().register("loser").unwrap().id;
    let rival = run.pool().register("rival").unwrap().id;
    store.arm("a", rival);
    assert!(run.coordinator().claim(&TaskId::from("a"), loser).is_err());

    let first = run.tick().unwrap();
    assert!(first
        .actions
        .iter()
        .any(|a| matches!(a, EscalationAction::DoubleClaimLogged { entries: 1, .. })));

    let second = run.tick().unwrap();
    assert!(!second
        .actions
        .iter()
        .any(|a| matches!(a, EscalationAction::DoubleClaimLogged { .. })));
    assert_eq!(store.read(&TaskId::from("a")).unwrap().owner, Some(rival));
    // Double claims are not the rival's fault.
    assert_eq!(run.pool().get(&rival).unwrap().failures, 0);
}

/// Test: Concurrent claims from many threads
/// Given eight workers claiming one task at once
/// When all claims complete
/// Then exactly one succeeds
#[test]
fn test_concurrent_claims_have_one_winner() {
    let h = Harness::new();
    h.run.submit(Task::new("a", "A")).unwrap();
    let workers: Vec<_> = (0..8).map(|i| h.register(&format!("w{}", i))).collect();

    let results: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = workers
            .iter()
            .map(|w| {
                let run = &h.run;
                s.spawn(move || run.coordinator().claim(&TaskId::from("a"), *w))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let winners: Vec<_> = results.iter().filter(|r| r.is_ok()).collect();
    assert_eq!(winners.len(), 1);
    for result in &results {
        if let Err(e) = result {
            assert!(matches!(e, Error::AlreadyClaimed { .. }), "unexpected {:?}", e);
        }
    }
    let owner = h.task("a").owner.unwrap();
    assert!(workers.contains(&owner));
}

/// Test: A worker holds one claim at a time
/// Given a worker that owns a task
/// When it claims a second task
/// Then the claim is refused with WorkerBusy until the first is released
#[test]
fn test_worker_holds_one_claim() {
    let h = Harness::new();
    h.run
        .submit_all(vec![Task::new("a", "A"), Task::new("b", "B")])
        .unwrap();
    let w = h.register("coder");
    let coord = h.run.coordinator();

    coord.claim(&TaskId::from("a"), w).unwrap();
    assert!(matches!(
        coord.claim(&TaskId::from("b"), w),
        Err(Error::WorkerBusy { .. })
    ));

    coord.release(&TaskId::from("a"), w, "switching").unwrap();
    assert!(coord.claim(&TaskId::from("b"), w).is_ok());
}

/// Test: Claims require a live worker
/// Given an unregistered worker and a retired one
/// When they claim
/// Then both are refused
#[test]
fn test_claim_requires_registered_live_worker() {
    let h = Harness::new();
    h.run.submit(Task::new("a", "A")).unwrap();
    let stranger = concord::WorkerId::new();
    assert!(matches!(
        h.run.coordinator().claim(&TaskId::from("a"), stranger),
        Err(Error::WorkerNotFound(_))
    ));

    let retired = h.register("coder");
    h.run.pool().retire(&retired, "session over").unwrap();
    assert!(matches!(
        h.run.coordinator().claim(&TaskId::from("a"), retired),
        Err(Error::WorkerRemoved(_))
    ));
    assert_eq!(h.task("a").status, TaskStatus::Pending);
}
