//! Worker pool.
//!
//! The `WorkerPool` manages worker records in the store: registration
//! against a capacity limit, heartbeats, failure counting, and retirement.
//! Retiring a worker always releases whatever it holds before the worker is
//! marked removed, so no in-flight task is lost with it.

use std::sync::Arc;

use chrono::Utc;

use crate::config::DEFAULT_MAX_WORKERS;
use crate::core::{TaskId, Worker, WorkerId, WorkerState};
use crate::error::{Error, Result};
use crate::orchestration::coordinator::ClaimCoordinator;
use crate::orchestration::events::{EventSink, RunEvent};
use crate::store::SharedStore;
use crate::{clog, clog_warn};

/// Failures after which a worker is removed.
pub const MAX_WORKER_FAILURES: u32 = 2;

pub struct WorkerPool {
    store: SharedStore,
    coordinator: Arc<ClaimCoordinator>,
    max_workers: usize,
    events: EventSink,
}

impl WorkerPool {
    pub fn new(store: SharedStore, coordinator: Arc<ClaimCoordinator>) -> Self {
        Self {
            store,
            coordinator,
            max_workers: DEFAULT_MAX_WORKERS,
            events: EventSink::none(),
        }
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Workers that have not been removed.
    pub fn active_workers(&self) -> Result<Vec<Worker>> {
        Ok(self
            .store
            .list_workers()?
            .into_iter()
            .filter(|w| !w.is_removed())
            .collect())
    }

    pub fn has_capacity(&self) -> Result<bool> {
        Ok(self.active_workers()?.len() < self.max_workers)
    }

    /// Register a new worker with the given role label.
    pub fn register(&self, role: &str) -> Result<Worker> {
        if !self.has_capacity()? {
            return Err(Error::WorkerPoolFull {
                max: self.max_workers,
            });
        }
        let worker = Worker::new(role);
        self.store.put_worker(worker.clone())?;
        clog!("Worker {} registered as {}", worker.id.short(), role);
        self.events.emit(RunEvent::WorkerRegistered {
            worker: worker.id,
            role: role.to_string(),
        });
        Ok(worker)
    }

    pub fn get(&self, worker: &WorkerId) -> Result<Worker> {
        self.store.read_worker(worker)
    }

    /// Record that the worker is alive. A stuck worker becomes active again.
    pub fn heartbeat(&self, worker: &WorkerId) -> Result<Worker> {
        let record = self.store.read_worker(worker)?;
        if record.is_removed() {
            return Err(Error::WorkerRemoved(*worker));
        }
        let now = Utc::now();
        self.store.update_worker(worker, &mut |w| {
            w.last_heartbeat = now;
            if w.state == WorkerState::Stuck {
                w.state = WorkerState::Active;
            }
        })
    }

    pub fn mark_stuck(&self, worker: &WorkerId) -> Result<Worker> {
        let updated = self.store.update_worker(worker, &mut |w| {
            if w.state == WorkerState::Active {
                w.state = WorkerState::Stuck;
            }
        })?;
        clog_warn!("Worker {} marked stuck", worker.short());
        Ok(updated)
    }

    /// Count a failure against the worker, returning the new total.
    pub fn record_failure(&self, worker: &WorkerId) -> Result<u32> {
        Ok(self
            .store
            .update_worker(worker, &mut |w| w.failures += 1)?
            .failures)
    }

    /// Release everything the worker holds, then mark it removed.
    ///
    /// Returns the released task ids. Retiring a removed worker is a no-op.
    pub fn retire(&self, worker: &WorkerId, reason: &str) -> Result<Vec<TaskId>> {
        let record = self.store.read_worker(worker)?;
        if record.is_removed() {
            return Ok(Vec::new());
        }

        let mut released = Vec::new();
        for task in self.store.list_tasks()? {
            if task.is_owned_by(worker) {
                self.coordinator
                    .release(&task.id, *worker, &format!("worker retired: {}", reason))?;
                released.push(task.id);
            }
        }

        let reason_owned = reason.to_string();
        self.store.update_worker(worker, &mut |w| {
            w.state = WorkerState::Removed;
            w.current_task = None;
            w.removal_reason = Some(reason_owned.clone());
        })?;
        clog!(
            "Worker {} retired ({}), released {} task(s)",
            worker.short(),
            reason,
            released.len()
        );
        self.events.emit(RunEvent::WorkerRetired {
            worker: *worker,
            reason: reason.to_string(),
        });
        Ok(released)
    }
}
