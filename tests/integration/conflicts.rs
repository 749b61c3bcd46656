//! Conflict handling and synthesis tests.
//!
//! These tests verify that contradictions between in-flight outputs hold
//! the tasks involved until arbitration, and that synthesis resolves what
//! evidence can settle while preserving what it cannot.

use concord::core::ConflictStatus;
use concord::orchestration::EscalationAction;
use concord::{Error, Task, TaskId, TaskStatus, TaskStore};

use crate::fixtures::{finding, Harness};

/// Test: In-flight conflict holds completion until arbitration
/// Given two executing tasks whose partial outputs disagree about "db"
/// When a tick records the conflict
/// Then neither can complete until it is arbitrated, and synthesis keeps
/// the arbitration result
#[test]
fn test_in_flight_conflict_holds_until_arbitrated() {
    let h = Harness::new();
    h.run
        .submit_all(vec![Task::new("a", "A"), Task::new("b", "B")])
        .unwrap();
    let coord = h.run.coordinator();
    let (a, b) = (TaskId::from("a"), TaskId::from("b"));
    let wa = h.register("a");
    let wb = h.register("b");
    for (id, w) in [(&a, wa), (&b, wb)] {
        coord.claim(id, w).unwrap();
        coord.start(id, w).unwrap();
    }
    coord
        .update_progress(&a, wa, Some(finding("db", "postgres", 3.0)))
        .unwrap();
    coord
        .update_progress(&b, wb, Some(finding("DB", "sqlite", 1.0)))
        .unwrap();

    let tick = h.run.tick().unwrap();
    let held = tick.actions.iter().find_map(|a| match a {
        EscalationAction::ConflictRecorded { conflict, held, .. } => Some((conflict.clone(), held.clone())),
        _ => None,
    });
    let (conflict, held) = held.expect("conflict recorded");
    assert_eq!(conflict, "db#a,b");
    assert_eq!(held.len(), 2);

    // A second tick does not record it again.
    assert!(h.run.tick().unwrap().actions.is_empty());

    assert!(matches!(
        coord.complete_with_output(&a, wa, finding("db", "postgres", 3.0)),
        Err(Error::AwaitingArbitration { .. })
    ));

    let resolved = h.run.arbitrate(&conflict).unwrap();
    assert_eq!(resolved.status, ConflictStatus::ResolvedByEvidence);
    assert_eq!(resolved.prevailing.as_deref(), Some("postgres"));

    coord
        .complete_with_output(&a, wa, finding("db", "postgres", 3.0))
        .unwrap();
    coord
        .complete_with_output(&b, wb, finding("DB", "sqlite", 1.0))
        .unwrap();

    let report = h.run.synthesize().unwrap();
    assert!(report.succeeded());
    assert_eq!(report.synthesis.resolved.len(), 1);
    assert_eq!(report.synthesis.resolved[0].conflict, conflict);
    // Unresolved record plus its resolution, nothing appended at synthesis.
    assert_eq!(h.store.conflicts().unwrap().len(), 2);
}

/// Test: Tied evidence preserves dissent
/// Given two completed tasks asserting different things with equal weight
/// When the run is synthesized
/// Then the contradiction is kept as dissent and the run does not succeed
#[test]
fn test_tied_evidence_is_reported_as_dissent() {
    let h = Harness::new();
    h.run
        .submit_all(vec![Task::new("a", "A"), Task::new("b", "B")])
        .unwrap();
    let w = h.register("coder");
    h.finish("a", w, finding("cache", "redis", 2.0));
    h.finish("b", w, finding("cache", "memcached", 2.0));

    let report = h.run.synthesize().unwrap();
    assert!(!report.succeeded());
    assert!(report.synthesis.resolved.is_empty());
    let dissent = &report.synthesis.dissenting_opinion;
    assert_eq!(dissent.len(), 1);
    assert_eq!(dissent[0].positions.len(), 2);
    assert!(dissent[0].rationale.contains("tied"));

    let log = h.store.conflicts().unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].status, ConflictStatus::DissentPreserved);
}

/// Test: Combined evidence outweighs a single claim
/// Given two tasks agreeing against one heavier dissenter
/// When the run is synthesized
/// Then the summed weight decides the outcome
#[test]
fn test_summed_weight_decides() {
    let h = Harness::new();
    h.run
        .submit_all(vec![
            Task::new("a", "A"),
            Task::new("b", "B"),
            Task::new("c", "C"),
        ])
        .unwrap();
    let w = h.register("coder");
    h.finish("a", w, finding("queue", "kafka", 1.5));
    h.finish("b", w, finding("queue", "Kafka", 1.5));
    h.finish("c", w, finding("queue", "rabbitmq", 2.0));

    let report = h.run.synthesize().unwrap();
    assert_eq!(report.synthesis.resolved.len(), 1);
    assert_eq!(report.synthesis.resolved[0].prevailing, "kafka");
    assert!(report.synthesis.dissenting_opinion.is_empty());
}

/// Test: Abandonment is never silent
/// Given one completed and one abandoned task
/// When the run is synthesized
/// Then the abandoned task is listed with its justification and the run
/// does not succeed
#[test]
fn test_abandoned_task_reported_in_final_output() {
    let h = Harness::new();
    h.run
        .submit_all(vec![Task::new("a", "A"), Task::new("b", "B")])
        .unwrap();
    let w = h.register("coder");
    h.finish("a", w, finding("api", "rest", 1.0));
    h.run.coordinator().claim(&TaskId::from("b"), w).unwrap();
    h.run
        .coordinator()
        .abandon(&TaskId::from("b"), w, "vendor API retired")
        .unwrap();
    assert_eq!(h.task("b").status, TaskStatus::Abandoned);

    let report = h.run.synthesize().unwrap();
    assert!(!report.succeeded());
    assert_eq!(report.synthesis.deliverable.len(), 1);
    assert_eq!(report.synthesis.agreements.len(), 1);
    assert_eq!(report.synthesis.abandoned.len(), 1);
    assert_eq!(report.synthesis.abandoned[0].justification, "vendor API retired");

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["succeeded"], false);
    assert_eq!(json["synthesis"]["abandoned"][0]["task"], "b");
}
