//! In-memory task store.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;

use super::{
    is_ownership_contention, CasConflict, RunState, StoreSnapshot, TaskStore, SNAPSHOT_VERSION,
};
use crate::core::{
    ConflictRecord, DependencyGraph, LedgerEntry, Message, Task, TaskId, TaskPatch, TaskSnapshot,
    TaskStatus, Worker, WorkerId,
};
use crate::error::{Error, Result};
use crate::{clog_debug, clog_trace};

#[derive(Default)]
struct Inner {
    tasks: HashMap<TaskId, Task>,
    order: Vec<TaskId>,
    dag: DependencyGraph,
    workers: HashMap<WorkerId, Worker>,
    worker_order: Vec<WorkerId>,
    messages: Vec<Message>,
    ledger: Vec<LedgerEntry>,
    conflicts: Vec<ConflictRecord>,
    cas_conflicts: Vec<CasConflict>,
    run_state: RunState,
    next_seq: u64,
}

impl Inner {
    fn seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

/// Task store held entirely in memory.
///
/// A single mutex guards every record, so each trait call is linearizable.
/// The lock is never held across an `.await`.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves records consistent: every
        // mutation is validated before it is written.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Export the full store contents.
    pub fn export(&self) -> StoreSnapshot {
        let inner = self.lock();
        StoreSnapshot {
            version: SNAPSHOT_VERSION,
            next_seq: inner.next_seq,
            tasks: inner
                .order
                .iter()
                .filter_map(|id| inner.tasks.get(id).cloned())
                .collect(),
            workers: inner
                .worker_order
                .iter()
                .filter_map(|id| inner.workers.get(id).cloned())
                .collect(),
            messages: inner.messages.clone(),
            ledger: inner.ledger.clone(),
            conflicts: inner.conflicts.clone(),
            cas_conflicts: inner.cas_conflicts.clone(),
            run_state: inner.run_state.clone(),
        }
    }

    /// Rebuild a store from an exported snapshot.
    pub fn import(snapshot: StoreSnapshot) -> Result<Self> {
        if snapshot.version > SNAPSHOT_VERSION {
            return Err(Error::Validation(format!(
                "store snapshot version {} is newer than supported {}",
                snapshot.version, SNAPSHOT_VERSION
            )));
        }
        let dag = DependencyGraph::from_tasks(
            snapshot
                .tasks
                .iter()
                .map(|t| (&t.id, t.dependencies.as_slice())),
        )?;
        let mut inner = Inner {
            dag,
            next_seq: snapshot.next_seq,
            messages: snapshot.messages,
            ledger: snapshot.ledger,
            conflicts: snapshot.conflicts,
            cas_conflicts: snapshot.cas_conflicts,
            run_state: snapshot.run_state,
            ..Default::default()
        };
        for task in snapshot.tasks {
            inner.order.push(task.id.clone());
            inner.tasks.insert(task.id.clone(), task);
        }
        for worker in snapshot.workers {
            inner.worker_order.push(worker.id);
            inner.workers.insert(worker.id, worker);
        }
        Ok(Self {
            inner: Mutex::new(inner),
        })
    }
}

fn validate_transition(
    task: &Task,
    next: &TaskSnapshot,
    candidate: &Task,
) -> Result<()> {
    if !task.status.can_transition_to(next.status) {
        return Err(Error::InvalidTransition {
            id: task.id.clone(),
            from: task.status,
            to: next.status,
        });
    }
    if next.status.is_active() && next.owner.is_none() {
        return Err(Error::Validation(format!(
            "task {} cannot be {} without an owner",
            task.id, next.status
        )));
    }
    if next.status == TaskStatus::Pending && next.owner.is_some() {
        return Err(Error::Validation(format!(
            "pending task {} cannot keep an owner",
            task.id
        )));
    }
    if next.status == TaskStatus::Complete
        && !candidate
            .output
            .as_ref()
            .map(|o| o.is_acceptable())
            .unwrap_or(false)
    {
        return Err(Error::Validation(format!(
            "task {} cannot complete with an empty output",
            task.id
        )));
    }
    if next.status == TaskStatus::Abandoned
        && candidate
            .justification
            .as_deref()
            .map(|j| j.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(Error::Validation(format!(
            "task {} cannot be abandoned without a justification",
            task.id
        )));
    }
    Ok(())
}

impl TaskStore for MemoryStore {
    fn create(&self, mut task: Task) -> Result<Task> {
        let mut inner = self.lock();
        if inner.tasks.contains_key(&task.id) {
            return Err(Error::Duplicate(task.id));
        }
        if task.status != TaskStatus::Pending || task.owner.is_some() {
            return Err(Error::Validation(format!(
                "task {} must be created pending and unowned",
                task.id
            )));
        }
        inner.dag.insert(&task.id, &task.dependencies)?;

        task.seq = inner.seq();
        task.created_at = Utc::now();
        clog_debug!(
            "store: created task {} seq={} deps={}",
            task.id,
            task.seq,
            task.dependencies.len()
        );
        inner.order.push(task.id.clone());
        inner.tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    fn read(&self, id: &TaskId) -> Result<Task> {
        self.lock()
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.clone()))
    }

    fn compare_and_set(
        &self,
        id: &TaskId,
        expected: TaskSnapshot,
        next: TaskSnapshot,
        patch: TaskPatch,
    ) -> Result<Task> {
        let mut inner = self.lock();
        let current = inner
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.clone()))?;

        let actual = current.snapshot();
        if actual != expected {
            if is_ownership_contention(&next, &actual) {
                let seq = inner.seq();
                inner.cas_conflicts.push(CasConflict {
                    seq,
                    task: id.clone(),
                    expected,
                    attempted: next,
                    actual,
                    at: Utc::now(),
                });
            }
            clog_trace!(
                "store: stale write on {} expected={} actual={}",
                id,
                expected,
                actual
            );
            return Err(Error::StaleWrite {
                id: id.clone(),
                actual,
            });
        }

        let mut candidate = current.clone();
        candidate.apply(patch);
        validate_transition(&current, &next, &candidate)?;

        let now = Utc::now();
        if current.status == TaskStatus::Pending && next.status == TaskStatus::Claimed {
            candidate.claimed_at = Some(now);
            if candidate.last_progress.map(|p| p < now).unwrap_or(true) {
                candidate.last_progress = Some(now);
            }
        }
        if next.status == TaskStatus::Pending {
            candidate.claimed_at = None;
        }
        if next.status.is_terminal() {
            candidate.finished_at = Some(now);
        }
        candidate.status = next.status;
        candidate.owner = next.owner;

        inner.tasks.insert(id.clone(), candidate.clone());
        Ok(candidate)
    }

    fn list_tasks(&self) -> Result<Vec<Task>> {
        let inner = self.lock();
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.tasks.get(id).cloned())
            .collect())
    }

    fn cas_conflicts(&self, id: &TaskId) -> Result<Vec<CasConflict>> {
        Ok(self
            .lock()
            .cas_conflicts
            .iter()
            .filter(|c| &c.task == id)
            .cloned()
            .collect())
    }

    fn put_worker(&self, worker: Worker) -> Result<()> {
        let mut inner = self.lock();
        if inner.workers.contains_key(&worker.id) {
            return Err(Error::Validation(format!(
                "worker {} already registered",
                worker.id
            )));
        }
        inner.worker_order.push(worker.id);
        inner.workers.insert(worker.id, worker);
        Ok(())
    }

    fn read_worker(&self, id: &WorkerId) -> Result<Worker> {
        self.lock()
            .workers
            .get(id)
            .cloned()
            .ok_or(Error::WorkerNotFound(*id))
    }

    fn update_worker(&self, id: &WorkerId, f: &mut dyn FnMut(&mut Worker)) -> Result<Worker> {
        let mut inner = self.lock();
        let worker = inner
            .workers
            .get_mut(id)
            .ok_or(Error::WorkerNotFound(*id))?;
        f(worker);
        Ok(worker.clone())
    }

    fn list_workers(&self) -> Result<Vec<Worker>> {
        let inner = self.lock();
        Ok(inner
            .worker_order
            .iter()
            .filter_map(|id| inner.workers.get(id).cloned())
            .collect())
    }

    fn append_message(&self, mut message: Message) -> Result<Message> {
        let mut inner = self.lock();
        message.seq = inner.seq();
        inner.messages.push(message.clone());
        Ok(message)
    }

    fn messages(&self) -> Result<Vec<Message>> {
        Ok(self.lock().messages.clone())
    }

    fn append_ledger(&self, mut entry: LedgerEntry) -> Result<LedgerEntry> {
        let mut inner = self.lock();
        entry.seq = inner.seq();
        inner.ledger.push(entry.clone());
        Ok(entry)
    }

    fn ledger(&self) -> Result<Vec<LedgerEntry>> {
        Ok(self.lock().ledger.clone())
    }

    fn append_conflict(&self, mut record: ConflictRecord) -> Result<ConflictRecord> {
        let mut inner = self.lock();
        record.seq = inner.seq();
        inner.conflicts.push(record.clone());
        Ok(record)
    }

    fn conflicts(&self) -> Result<Vec<ConflictRecord>> {
        Ok(self.lock().conflicts.clone())
    }

    fn run_state(&self) -> Result<RunState> {
        Ok(self.lock().run_state.clone())
    }

    fn put_run_state(&self, state: RunState) -> Result<()> {
        self.lock().run_state = state;
        Ok(())
    }
}
