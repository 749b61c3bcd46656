//! Escalation tests.
//!
//! These tests walk tasks through the bounded remediation ladder: a stalled
//! task is nudged, released and finally abandoned; an off-scope task is
//! re-issued with a boundary and abandoned if it strays again; losing the
//! execution capability switches the run to sequential fallback.

use concord::core::{FailureClass, MessageKind, Scope};
use concord::orchestration::EscalationAction;
use concord::store::RunMode;
use concord::{Error, Payload, Task, TaskId, TaskStatus, TaskStore};

use crate::fixtures::{after, finding, Harness};

fn has<F: Fn(&EscalationAction) -> bool>(actions: &[EscalationAction], f: F) -> bool {
    actions.iter().any(f)
}

/// Test: Stall ladder ends in abandonment
/// Given a task expected to take 10s (stall threshold 20s, grace 30s)
/// When two different workers each stall on it
/// Then it is clarified and released once, then clarified and abandoned
#[test]
fn test_stall_twice_abandons_with_justification() {
    let h = Harness::new();
    h.run
        .submit(Task::new("a", "A").with_expected_duration(10))
        .unwrap();
    let id = TaskId::from("a");

    let first = h.register("first");
    h.run.coordinator().claim(&id, first).unwrap();
    let since = h.task("a").last_progress.unwrap();

    let early = h.run.tick_at(after(since, 19)).unwrap();
    assert!(early.actions.is_empty());

    let nudge = h.run.tick_at(after(since, 21)).unwrap();
    assert!(has(&nudge.actions, |a| matches!(a, EscalationAction::Clarified { .. })));
    let inbox = h.run.messaging().inbox(&first, 0).unwrap();
    assert!(inbox.iter().any(|m| m.kind == MessageKind::Clarification));

    let within_grace = h.run.tick_at(after(since, 40)).unwrap();
    assert!(within_grace.actions.is_empty());

    let release = h.run.tick_at(after(since, 52)).unwrap();
    assert!(has(&release.actions, |a| matches!(
        a,
        EscalationAction::Released {
            class: FailureClass::Stalled,
            retries: 1,
            ..
        }
    )));
    assert_eq!(h.task("a").status, TaskStatus::Pending);

    let second = h.register("second");
    h.run.coordinator().claim(&id, second).unwrap();
    let since = h.task("a").last_progress.unwrap();
    h.run.tick_at(after(since, 21)).unwrap();
    let end = h.run.tick_at(after(since, 52)).unwrap();
    assert!(has(&end.actions, |a| matches!(
        a,
        EscalationAction::Abandoned {
            class: FailureClass::Stalled,
            ..
        }
    )));

    let task = h.task("a");
    assert_eq!(task.status, TaskStatus::Abandoned);
    assert!(!task.justification.unwrap_or_default().is_empty());
}

/// Test: Heartbeats keep a task alive
/// Given a nudged task
/// When the owner reports progress before the grace period ends
/// Then the task is not released
#[test]
fn test_progress_after_nudge_prevents_release() {
    let h = Harness::new();
    h.run
        .submit(Task::new("a", "A").with_expected_duration(10))
        .unwrap();
    let id = TaskId::from("a");
    let w = h.register("coder");
    h.run.coordinator().claim(&id, w).unwrap();
    let since = h.task("a").last_progress.unwrap();

    h.run.tick_at(after(since, 21)).unwrap();
    h.run.coordinator().start(&id, w).unwrap();
    let progressed = h.task("a").last_progress.unwrap();

    let later = h.run.tick_at(after(progressed, 10)).unwrap();
    assert!(later.actions.is_empty());
    assert_eq!(h.task("a").status, TaskStatus::Executing);
    assert_eq!(h.task("a").owner, Some(w));
}

/// Test: Off-scope output is re-issued, then abandoned
/// Given a task scoped to "auth"
/// When its output reports on "billing" twice
/// Then it is re-issued with an explicit boundary, then abandoned
#[test]
fn test_off_scope_reissue_then_abandon() {
    let h = Harness::new();
    h.run
        .submit(
            Task::new("auth", "Audit auth")
                .with_scope(Scope::new(Payload::text("auth module")).with_subjects(["auth"])),
        )
        .unwrap();
    let id = TaskId::from("auth");
    let coord = h.run.coordinator();

    let first = h.register("first");
    coord.claim(&id, first).unwrap();
    coord.start(&id, first).unwrap();
    assert!(matches!(
        coord.complete_with_output(&id, first, finding("billing", "use stripe", 1.0)),
        Err(Error::OffScope { .. })
    ));
    coord
        .update_progress(&id, first, Some(finding("billing", "use stripe", 1.0)))
        .unwrap();

    let reissue = h.run.tick().unwrap();
    assert!(has(&reissue.actions, |a| matches!(a, EscalationAction::Reissued { .. })));
    let task = h.task("auth");
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.output.is_none());
    let boundary = task.scope.boundary.unwrap();
    assert!(boundary.contains("auth"));
    assert!(boundary.contains("billing"));
    assert!(h
        .run
        .messaging()
        .inbox(&first, 0)
        .unwrap()
        .iter()
        .any(|m| m.kind == MessageKind::ScopeReissue));

    let second = h.register("second");
    coord.claim(&id, second).unwrap();
    coord
        .update_progress(&id, second, Some(finding("billing", "use paypal", 1.0)))
        .unwrap();
    let end = h.run.tick().unwrap();
    assert!(has(&end.actions, |a| matches!(
        a,
        EscalationAction::Abandoned {
            class: FailureClass::OffScope,
            ..
        }
    )));
    assert_eq!(h.task("auth").status, TaskStatus::Abandoned);
}

/// Test: Capability loss enters sequential fallback
/// Given a worker that reports its execution capability is gone
/// When other workers claim afterwards
/// Then only one task may be in flight at a time
#[test]
fn test_capability_loss_serializes_claims() {
    let h = Harness::new();
    h.run
        .submit_all(vec![
            Task::new("a", "A"),
            Task::new("b", "B"),
            Task::new("c", "C"),
        ])
        .unwrap();
    let coord = h.run.coordinator();
    let broken = h.register("broken");
    coord.claim(&TaskId::from("a"), broken).unwrap();

    let actions = h
        .run
        .escalation()
        .report_capability_unavailable(broken, Some(&TaskId::from("a")), "sandbox gone")
        .unwrap();
    assert!(has(&actions, |a| matches!(a, EscalationAction::FallbackEntered { .. })));
    assert_eq!(h.task("a").status, TaskStatus::Pending);

    let status = h.run.status().unwrap();
    assert_eq!(status.mode, RunMode::SequentialFallback);
    assert_eq!(status.fallback_reason.as_deref(), Some("sandbox gone"));

    let w1 = h.register("w1");
    let w2 = h.register("w2");
    coord.claim(&TaskId::from("b"), w1).unwrap();
    match coord.claim(&TaskId::from("c"), w2) {
        Err(Error::SequentialFallback { active }) => assert_eq!(active, TaskId::from("b")),
        other => panic!("expected SequentialFallback, got {:?}", other.map(|g| g.task.id)),
    }

    h.finish_claimed("b", w1);
    assert!(coord.claim(&TaskId::from("c"), w2).is_ok());
}

/// Test: Repeated failures retire a worker
/// Given a worker whose executions fail twice
/// When the second failure is reported
/// Then the worker is removed and its claims are released
#[test]
fn test_two_failures_retire_worker() {
    let h = Harness::new();
    h.run
        .submit_all(vec![Task::new("a", "A"), Task::new("b", "B")])
        .unwrap();
    let coord = h.run.coordinator();
    let escalation = h.run.escalation();
    let w = h.register("flaky");

    coord.claim(&TaskId::from("a"), w).unwrap();
    let first = escalation
        .report_execution_failure(w, &TaskId::from("a"), "compile error")
        .unwrap();
    assert!(first.is_empty());

    coord.claim(&TaskId::from("b"), w).unwrap();
    let second = escalation
        .report_execution_failure(w, &TaskId::from("b"), "compile error")
        .unwrap();
    assert!(has(&second, |a| matches!(a, EscalationAction::WorkerRemoved { .. })));

    assert!(h.run.pool().get(&w).unwrap().is_removed());
    assert_eq!(h.task("a").status, TaskStatus::Pending);
    assert_eq!(h.task("b").status, TaskStatus::Pending);
    assert!(h.store.list_tasks().unwrap().iter().all(|t| t.owner.is_none()));
}
