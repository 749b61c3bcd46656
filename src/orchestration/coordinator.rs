//! Claim coordination.
//!
//! The `ClaimCoordinator` is the only component that changes a task's
//! status or owner. Every change is a compare-and-set against the store,
//! so when two workers race for the same task the first write wins and the
//! loser sees `AlreadyClaimed` with nothing changed.
//!
//! Before a claim reaches the store the coordinator consults, in order:
//! the worker record, the cost governor, the run mode, and the dependency
//! resolver.

use std::sync::Arc;

use chrono::Utc;

use crate::core::{
    EscalationState, Task, TaskId, TaskOutput, TaskPatch, TaskSnapshot, TaskStatus, WorkerId,
};
use crate::error::{Error, Result};
use crate::orchestration::events::{EventSink, RunEvent};
use crate::orchestration::governor::CostGovernor;
use crate::orchestration::resolver::DependencyResolver;
use crate::store::{RunMode, SharedStore};
use crate::{clog, clog_debug, clog_warn};

/// What a worker receives for a successful claim: the full task and the
/// outputs of everything it depends on.
#[derive(Debug, Clone)]
pub struct ClaimGrant {
    pub task: Task,
    pub dependency_outputs: Vec<(TaskId, TaskOutput)>,
}

pub struct ClaimCoordinator {
    store: SharedStore,
    resolver: DependencyResolver,
    governor: Arc<CostGovernor>,
    events: EventSink,
}

impl ClaimCoordinator {
    pub fn new(store: SharedStore, governor: Arc<CostGovernor>) -> Self {
        Self {
            resolver: DependencyResolver::new(store.clone()),
            store,
            governor,
            events: EventSink::none(),
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn resolver(&self) -> &DependencyResolver {
        &self.resolver
    }

    /// Submit a new task.
    pub fn create(&self, task: Task) -> Result<Task> {
        let task = self.store.create(task)?;
        clog!("Task created: {} \"{}\"", task.id, task.title);
        self.events.emit(RunEvent::TaskCreated {
            task: task.id.clone(),
        });
        Ok(task)
    }

    pub fn read(&self, id: &TaskId) -> Result<Task> {
        self.store.read(id)
    }

    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        self.store.list_tasks()
    }

    pub fn eligible_tasks(&self) -> Result<Vec<Task>> {
        self.resolver.eligible_tasks()
    }

    /// Claim a pending task for `worker`.
    ///
    /// # Errors
    /// - `AlreadyClaimed` when another worker owns the task or wins the race
    /// - `NotEligible` when the task is terminal or a dependency is incomplete
    /// - `BudgetExceeded` / `CheckpointRequired` when the governor refuses
    /// - `SequentialFallback` when another task is in flight in fallback mode
    /// - `WorkerBusy` / `WorkerRemoved` / `WorkerNotFound` for the worker
    pub fn claim(&self, id: &TaskId, worker: WorkerId) -> Result<ClaimGrant> {
        self.check_worker(worker)?;
        if let Err(e) = self.governor.admit() {
            clog_warn!("Claim of {} refused: {}", id, e);
            return Err(e);
        }
        let sequential = self.store.run_state()?.mode == RunMode::SequentialFallback;
        if sequential {
            if let Some(active) = self.in_flight_other_than(id)? {
                return Err(Error::SequentialFallback { active });
            }
        }
        self.resolver.check_eligible(id)?;

        let claimed = match self.store.compare_and_set(
            id,
            TaskSnapshot::pending(),
            TaskSnapshot::new(TaskStatus::Claimed, Some(worker)),
            TaskPatch::default(),
        ) {
            Ok(task) => task,
            Err(Error::StaleWrite { actual, .. }) => {
                return Err(self.lost_claim(id, worker, actual));
            }
            Err(e) => return Err(e),
        };

        // Two workers may both have seen an idle run. The earliest claim
        // keeps the slot; later ones back off.
        if sequential {
            if let Some(active) = self.earlier_claim(&claimed)? {
                self.store.compare_and_set(
                    id,
                    claimed.snapshot(),
                    TaskSnapshot::pending(),
                    TaskPatch::default(),
                )?;
                clog_debug!("Claim of {} backed off for {}", id, active);
                return Err(Error::SequentialFallback { active });
            }
        }

        let now = Utc::now();
        self.store.update_worker(&worker, &mut |w| {
            w.current_task = Some(id.clone());
            w.last_heartbeat = now;
        })?;

        let dependency_outputs = self.resolver.dependency_outputs(&claimed)?;
        clog!("Task {} claimed by worker {}", id, worker.short());
        self.events.emit(RunEvent::TaskClaimed {
            task: id.clone(),
            worker,
        });
        Ok(ClaimGrant {
            task: claimed,
            dependency_outputs,
        })
    }

    /// Move a claimed task to executing.
    pub fn start(&self, id: &TaskId, worker: WorkerId) -> Result<Task> {
        let task = self.store.compare_and_set(
            id,
            TaskSnapshot::new(TaskStatus::Claimed, Some(worker)),
            TaskSnapshot::new(TaskStatus::Executing, Some(worker)),
            TaskPatch::progress(Utc::now()),
        )?;
        self.touch(worker)?;
        clog_debug!("Task {} executing on worker {}", id, worker.short());
        self.events.emit(RunEvent::TaskStarted {
            task: id.clone(),
            worker,
        });
        Ok(task)
    }

    /// Heartbeat from the owner, optionally with a partial output.
    pub fn update_progress(
        &self,
        id: &TaskId,
        worker: WorkerId,
        partial: Option<TaskOutput>,
    ) -> Result<Task> {
        let task = self.store.read(id)?;
        let owned = TaskSnapshot::new(task.status, Some(worker));
        let mut patch = TaskPatch::progress(Utc::now());
        if let Some(output) = partial {
            patch = patch.with_output(output);
        }
        let task = self.store.compare_and_set(id, owned, owned, patch)?;
        self.touch(worker)?;
        Ok(task)
    }

    /// Finish an executing task with its output.
    ///
    /// # Errors
    /// - `AwaitingArbitration` while the task is held on a conflict
    /// - `OffScope` when findings fall outside the task's declared scope
    /// - `Validation` for an empty output not marked empty-by-design
    pub fn complete_with_output(
        &self,
        id: &TaskId,
        worker: WorkerId,
        output: TaskOutput,
    ) -> Result<Task> {
        let task = self.store.read(id)?;
        if !task.is_owned_by(&worker) {
            return Err(Error::StaleWrite {
                id: id.clone(),
                actual: task.snapshot(),
            });
        }
        if let Some(conflict) = &task.escalation.held_for {
            return Err(Error::AwaitingArbitration {
                id: id.clone(),
                conflict: conflict.clone(),
            });
        }
        let outside = task.scope.violations(&output.findings);
        if !outside.is_empty() {
            return Err(Error::OffScope {
                id: id.clone(),
                subjects: outside,
            });
        }

        let task = self.store.compare_and_set(
            id,
            task.snapshot(),
            TaskSnapshot::new(TaskStatus::Complete, Some(worker)),
            TaskPatch::progress(Utc::now()).with_output(output),
        )?;
        self.clear_claim(worker, id)?;
        clog!("Task {} completed by worker {}", id, worker.short());
        self.events.emit(RunEvent::TaskCompleted {
            task: id.clone(),
            worker,
        });
        Ok(task)
    }

    /// Return a task to pending. A task that is already pending is left as is.
    pub fn release(&self, id: &TaskId, worker: WorkerId, reason: &str) -> Result<Task> {
        self.release_with(id, worker, reason, TaskPatch::default())
    }

    pub(crate) fn release_with(
        &self,
        id: &TaskId,
        worker: WorkerId,
        reason: &str,
        patch: TaskPatch,
    ) -> Result<Task> {
        let task = self.store.read(id)?;
        if task.status == TaskStatus::Pending {
            clog_debug!("Release of {} skipped: already pending", id);
            return Ok(task);
        }
        if task.is_terminal() {
            return Err(Error::InvalidTransition {
                id: id.clone(),
                from: task.status,
                to: TaskStatus::Pending,
            });
        }

        let released = match self.store.compare_and_set(
            id,
            TaskSnapshot::new(task.status, Some(worker)),
            TaskSnapshot::pending(),
            patch,
        ) {
            Ok(task) => task,
            Err(Error::StaleWrite { actual, .. }) if actual.status == TaskStatus::Pending => {
                return self.store.read(id);
            }
            Err(e) => return Err(e),
        };
        self.clear_claim(worker, id)?;
        clog!(
            "Task {} released by worker {}: {}",
            id,
            worker.short(),
            reason
        );
        self.events.emit(RunEvent::TaskReleased {
            task: id.clone(),
            worker,
            reason: reason.to_string(),
        });
        Ok(released)
    }

    /// Give up on a task for good. A justification is required.
    pub fn abandon(&self, id: &TaskId, worker: WorkerId, justification: &str) -> Result<Task> {
        self.abandon_with(id, worker, justification, TaskPatch::default())
    }

    pub(crate) fn abandon_with(
        &self,
        id: &TaskId,
        worker: WorkerId,
        justification: &str,
        patch: TaskPatch,
    ) -> Result<Task> {
        let task = self.store.read(id)?;
        let task = self.store.compare_and_set(
            id,
            TaskSnapshot::new(task.status, Some(worker)),
            TaskSnapshot::new(TaskStatus::Abandoned, Some(worker)),
            patch.with_justification(justification),
        )?;
        self.clear_claim(worker, id)?;
        clog_warn!("Task {} abandoned: {}", id, justification);
        self.events.emit(RunEvent::TaskAbandoned {
            task: id.clone(),
            justification: justification.to_string(),
        });
        Ok(task)
    }

    /// Write escalation bookkeeping without changing status or owner.
    pub(crate) fn annotate(&self, task: &Task, escalation: EscalationState) -> Result<Task> {
        let snapshot = task.snapshot();
        self.store.compare_and_set(
            &task.id,
            snapshot,
            snapshot,
            TaskPatch::default().with_escalation(escalation),
        )
    }

    fn check_worker(&self, worker: WorkerId) -> Result<()> {
        let record = self.store.read_worker(&worker)?;
        if record.is_removed() {
            return Err(Error::WorkerRemoved(worker));
        }
        if let Some(current) = record.current_task {
            match self.store.read(&current) {
                Ok(task) if task.is_owned_by(&worker) => {
                    return Err(Error::WorkerBusy {
                        worker,
                        task: current,
                    });
                }
                // The pointer is stale: the task moved on without us.
                _ => {}
            }
        }
        Ok(())
    }

    fn lost_claim(&self, id: &TaskId, worker: WorkerId, actual: TaskSnapshot) -> Error {
        match actual.owner {
            Some(owner) if actual.status.is_active() => {
                clog_warn!(
                    "Claim race on {}: worker {} lost to {}",
                    id,
                    worker.short(),
                    owner.short()
                );
                self.events.emit(RunEvent::ClaimLost {
                    task: id.clone(),
                    worker,
                    owner,
                });
                Error::AlreadyClaimed {
                    id: id.clone(),
                    owner,
                }
            }
            _ => Error::NotEligible {
                id: id.clone(),
                status: actual.status,
            },
        }
    }

    fn in_flight_other_than(&self, id: &TaskId) -> Result<Option<TaskId>> {
        Ok(self
            .store
            .list_tasks()?
            .into_iter()
            .find(|t| t.status.is_active() && &t.id != id)
            .map(|t| t.id))
    }

    /// The in-flight task claimed before `claimed`, if any.
    fn earlier_claim(&self, claimed: &Task) -> Result<Option<TaskId>> {
        let first = self
            .store
            .list_tasks()?
            .into_iter()
            .filter(|t| t.status.is_active())
            .min_by_key(|t| (t.claimed_at, t.seq));
        Ok(first.filter(|t| t.id != claimed.id).map(|t| t.id))
    }

    fn touch(&self, worker: WorkerId) -> Result<()> {
        let now = Utc::now();
        match self
            .store
            .update_worker(&worker, &mut |w| w.last_heartbeat = now)
        {
            Ok(_) | Err(Error::WorkerNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn clear_claim(&self, worker: WorkerId, id: &TaskId) -> Result<()> {
        match self.store.update_worker(&worker, &mut |w| {
            if w.current_task.as_ref() == Some(id) {
                w.current_task = None;
            }
        }) {
            Ok(_) | Err(Error::WorkerNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
