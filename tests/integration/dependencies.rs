//! Dependency resolution tests.
//!
//! These tests verify that cycles are rejected at creation and that tasks
//! only become eligible once every dependency is complete.

use concord::{Error, Task, TaskId, TaskStatus, TaskStore};

use crate::fixtures::{diamond, finding, Harness};

fn eligible_ids(h: &Harness) -> Vec<String> {
    h.run
        .coordinator()
        .eligible_tasks()
        .unwrap()
        .into_iter()
        .map(|t| t.id.to_string())
        .collect()
}

/// Test: Cycle rejected at creation
/// Given a -> b
/// When b -> a is submitted
/// Then creation fails with Cycle and b is not stored
#[test]
fn test_cycle_rejected_and_not_stored() {
    let h = Harness::new();
    h.run.submit(Task::new("a", "A").with_dependency("b")).unwrap();
    assert!(matches!(
        h.run.submit(Task::new("b", "B").with_dependency("a")),
        Err(Error::Cycle { .. })
    ));
    assert!(matches!(
        h.store.read(&TaskId::from("b")),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn test_self_dependency_rejected() {
    let h = Harness::new();
    assert!(matches!(
        h.run.submit(Task::new("a", "A").with_dependency("a")),
        Err(Error::Cycle { .. })
    ));
}

#[test]
fn test_duplicate_id_rejected() {
    let h = Harness::new();
    h.run.submit(Task::new("a", "A")).unwrap();
    assert!(matches!(
        h.run.submit(Task::new("a", "Again")),
        Err(Error::Duplicate(_))
    ));
    assert_eq!(h.task("a").title, "A");
}

/// Test: Diamond unlocks in order
/// Given a <- b, a <- c, (b, c) <- d
/// When tasks complete one layer at a time
/// Then each layer becomes eligible only after the previous one
#[test]
fn test_diamond_unlocks_layer_by_layer() {
    let h = Harness::new();
    h.run.submit_all(diamond()).unwrap();
    let w = h.register("coder");

    assert_eq!(eligible_ids(&h), vec!["a"]);
    assert!(matches!(
        h.run.coordinator().claim(&TaskId::from("d"), w),
        Err(Error::NotEligible { .. })
    ));

    h.finish("a", w, finding("a", "done", 1.0));
    assert_eq!(eligible_ids(&h), vec!["b", "c"]);

    h.finish("b", w, finding("b", "done", 1.0));
    assert_eq!(eligible_ids(&h), vec!["c"]);
    h.finish("c", w, finding("c", "done", 1.0));

    let grant = h.run.coordinator().claim(&TaskId::from("d"), w).unwrap();
    let deps: Vec<String> = grant
        .dependency_outputs
        .iter()
        .map(|(id, _)| id.to_string())
        .collect();
    assert_eq!(deps, vec!["b", "c"]);
}

/// Test: Forward references
/// Given b depending on a task that does not exist yet
/// When the dependency is later created and completed
/// Then b becomes eligible
#[test]
fn test_forward_reference_waits_for_dependency() {
    let h = Harness::new();
    h.run.submit(Task::new("b", "B").with_dependency("x")).unwrap();
    assert!(eligible_ids(&h).is_empty());

    h.run.submit(Task::new("x", "X")).unwrap();
    assert_eq!(eligible_ids(&h), vec!["x"]);

    let w = h.register("coder");
    h.finish("x", w, finding("x", "done", 1.0));
    assert_eq!(eligible_ids(&h), vec!["b"]);
}

/// Test: Abandoned dependency blocks dependents
/// Given b depending on a
/// When a is abandoned
/// Then b never becomes eligible and synthesis reports the run incomplete
#[test]
fn test_abandoned_dependency_blocks_dependents() {
    let h = Harness::new();
    h.run
        .submit_all(vec![Task::new("a", "A"), Task::new("b", "B").with_dependency("a")])
        .unwrap();
    let w = h.register("coder");
    h.run.coordinator().claim(&TaskId::from("a"), w).unwrap();
    h.run
        .coordinator()
        .abandon(&TaskId::from("a"), w, "upstream service gone")
        .unwrap();

    assert_eq!(h.task("a").status, TaskStatus::Abandoned);
    assert!(eligible_ids(&h).is_empty());
    match h.run.synthesize() {
        Err(Error::IncompleteRun { pending }) => assert_eq!(pending, vec![TaskId::from("b")]),
        other => panic!("expected IncompleteRun, got {:?}", other.map(|r| r.succeeded())),
    }
}
