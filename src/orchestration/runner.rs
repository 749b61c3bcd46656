//! Worker loop runtime.
//!
//! A `WorkerLoop` drives one registered worker through the claim protocol:
//! poll for eligible tasks, claim one, start it, execute it while sending
//! heartbeats, then complete or release it. Execution itself is delegated to
//! a [`TaskExecutor`].
//!
//! `AlreadyClaimed` and `StaleWrite` are handled here by moving on to the
//! next task. Budget refusals and sequential fallback make the loop wait.
//! Failures the executor reports are handed to the `EscalationEngine`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::core::{Task, TaskId, TaskOutput, TaskStatus, WorkerId};
use crate::error::{Error, Result};
use crate::orchestration::coordinator::{ClaimCoordinator, ClaimGrant};
use crate::orchestration::escalation::EscalationEngine;
use crate::orchestration::governor::CostGovernor;
use crate::orchestration::pool::WorkerPool;
use crate::{clog, clog_debug, clog_trace, clog_warn};

/// Why an executor could not produce an output.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecError {
    /// The execution capability itself is gone (tool missing, backend down).
    #[error("capability unavailable: {0}")]
    CapabilityUnavailable(String),

    #[error("execution failed: {0}")]
    Failed(String),
}

/// A finished execution: the output and the cost units it consumed.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub output: TaskOutput,
    pub units: u64,
}

impl Execution {
    pub fn new(output: TaskOutput, units: u64) -> Self {
        Self { output, units }
    }
}

/// Does the actual work for a claimed task.
pub trait TaskExecutor: Send + Sync {
    fn execute<'a>(
        &'a self,
        grant: &'a ClaimGrant,
    ) -> BoxFuture<'a, std::result::Result<Execution, ExecError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopExit {
    /// Every task is complete or abandoned.
    Drained,
    /// Nothing is in flight and nothing is eligible.
    Blocked,
    Cancelled,
    /// The worker was retired by escalation.
    Removed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoopSummary {
    pub worker: WorkerId,
    pub completed: Vec<TaskId>,
    pub failures: u32,
    pub exit: LoopExit,
}

enum Claim {
    Granted(Box<ClaimGrant>),
    Wait,
    Removed,
}

enum Step {
    Next,
    Cancelled,
}

pub struct WorkerLoop {
    worker: WorkerId,
    coordinator: Arc<ClaimCoordinator>,
    governor: Arc<CostGovernor>,
    escalation: Arc<EscalationEngine>,
    pool: Arc<WorkerPool>,
    executor: Arc<dyn TaskExecutor>,
    poll_interval: Duration,
    heartbeat_interval: Duration,
    cancel: CancellationToken,
}

impl WorkerLoop {
    pub fn new(
        worker: WorkerId,
        coordinator: Arc<ClaimCoordinator>,
        governor: Arc<CostGovernor>,
        escalation: Arc<EscalationEngine>,
        pool: Arc<WorkerPool>,
        executor: Arc<dyn TaskExecutor>,
        cancel: CancellationToken,
    ) -> Self {
        let defaults = WorkerConfig::default();
        Self {
            worker,
            coordinator,
            governor,
            escalation,
            pool,
            executor,
            poll_interval: defaults.poll_interval(),
            heartbeat_interval: defaults.heartbeat_interval(),
            cancel,
        }
    }

    pub fn with_intervals(mut self, config: &WorkerConfig) -> Self {
        self.poll_interval = config.poll_interval();
        self.heartbeat_interval = config.heartbeat_interval();
        self
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Run until the store drains, the token is cancelled, or the worker is
    /// removed. The worker is retired on the way out.
    pub async fn run(self) -> Result<LoopSummary> {
        clog!("Worker loop {} started", self.worker.short());
        let mut summary = LoopSummary {
            worker: self.worker,
            completed: Vec::new(),
            failures: 0,
            exit: LoopExit::Drained,
        };

        let exit = self.drive(&mut summary).await;
        let reason = match &exit {
            Ok(LoopExit::Drained) => "run drained".to_string(),
            Ok(LoopExit::Blocked) => "no eligible work".to_string(),
            Ok(LoopExit::Cancelled) => "cancelled".to_string(),
            Ok(LoopExit::Removed) => "removed".to_string(),
            Err(e) => format!("loop error: {}", e),
        };
        match self.pool.retire(&self.worker, &reason) {
            Ok(_) | Err(Error::WorkerNotFound(_)) => {}
            Err(e) => clog_warn!("Retiring worker {} failed: {}", self.worker.short(), e),
        }

        summary.exit = exit?;
        clog!(
            "Worker loop {} exited ({:?}): {} completed, {} failure(s)",
            self.worker.short(),
            summary.exit,
            summary.completed.len(),
            summary.failures
        );
        Ok(summary)
    }

    async fn drive(&self, summary: &mut LoopSummary) -> Result<LoopExit> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(LoopExit::Cancelled);
            }
            let tasks = self.coordinator.list_tasks()?;
            if tasks.iter().all(|t| t.is_terminal()) {
                return Ok(LoopExit::Drained);
            }

            match self.next_claim()? {
                Claim::Granted(grant) => {
                    if let Step::Cancelled = self.work(*grant, summary).await? {
                        return Ok(LoopExit::Cancelled);
                    }
                }
                Claim::Removed => return Ok(LoopExit::Removed),
                Claim::Wait => {
                    let tasks = self.coordinator.list_tasks()?;
                    if tasks.iter().all(|t| t.is_terminal()) {
                        return Ok(LoopExit::Drained);
                    }
                    if is_blocked(&tasks) {
                        return Ok(LoopExit::Blocked);
                    }
                    match self.pool.heartbeat(&self.worker) {
                        Ok(_) => {}
                        Err(Error::WorkerRemoved(_)) => return Ok(LoopExit::Removed),
                        Err(e) => return Err(e),
                    }
                    if !self.pause().await {
                        return Ok(LoopExit::Cancelled);
                    }
                }
            }
        }
    }

    fn next_claim(&self) -> Result<Claim> {
        for task in self.coordinator.eligible_tasks()? {
            match self.coordinator.claim(&task.id, self.worker) {
                Ok(grant) => return Ok(Claim::Granted(Box::new(grant))),
                Err(e) if e.is_recoverable() => {
                    clog_trace!("worker {}: {}", self.worker.short(), e);
                }
                Err(e) if e.is_admission_refusal() => {
                    clog_debug!("worker {} waiting: {}", self.worker.short(), e);
                    return Ok(Claim::Wait);
                }
                Err(Error::WorkerBusy { .. }) => return Ok(Claim::Wait),
                Err(Error::WorkerRemoved(_)) => return Ok(Claim::Removed),
                Err(e) => return Err(e),
            }
        }
        Ok(Claim::Wait)
    }

    async fn work(&self, grant: ClaimGrant, summary: &mut LoopSummary) -> Result<Step> {
        let id = grant.task.id.clone();
        match self.coordinator.start(&id, self.worker) {
            Ok(_) => {}
            Err(e) if e.is_recoverable() => {
                clog_debug!("worker {}: start of {} lost: {}", self.worker.short(), id, e);
                return Ok(Step::Next);
            }
            Err(e) => return Err(e),
        }

        let outcome = {
            let mut execution = self.executor.execute(&grant);
            let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
            heartbeat.tick().await;
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        self.coordinator.release(&id, self.worker, "worker cancelled")?;
                        return Ok(Step::Cancelled);
                    }
                    result = &mut execution => break result,
                    _ = heartbeat.tick() => {
                        if !self.progress(&id, None)? {
                            clog_warn!(
                                "worker {}: lost {} during execution",
                                self.worker.short(),
                                id
                            );
                            return Ok(Step::Next);
                        }
                    }
                }
            }
        };

        match outcome {
            Ok(execution) => {
                self.governor.record(self.worker, &id, execution.units)?;
                self.finish(&id, execution.output, summary).await
            }
            Err(ExecError::CapabilityUnavailable(reason)) => {
                summary.failures += 1;
                self.escalation
                    .report_capability_unavailable(self.worker, Some(&id), &reason)?;
                Ok(Step::Next)
            }
            Err(ExecError::Failed(reason)) => {
                summary.failures += 1;
                self.escalation
                    .report_execution_failure(self.worker, &id, &reason)?;
                Ok(Step::Next)
            }
        }
    }

    async fn finish(
        &self,
        id: &TaskId,
        output: TaskOutput,
        summary: &mut LoopSummary,
    ) -> Result<Step> {
        loop {
            match self
                .coordinator
                .complete_with_output(id, self.worker, output.clone())
            {
                Ok(_) => {
                    summary.completed.push(id.clone());
                    return Ok(Step::Next);
                }
                Err(Error::AwaitingArbitration { conflict, .. }) => {
                    clog_debug!("worker {}: {} held on {}", self.worker.short(), id, conflict);
                    if !self.progress(id, Some(output.clone()))? {
                        return Ok(Step::Next);
                    }
                    if !self.pause().await {
                        self.coordinator.release(id, self.worker, "worker cancelled")?;
                        return Ok(Step::Cancelled);
                    }
                }
                Err(Error::OffScope { subjects, .. }) => {
                    // Escalation re-issues the task from the stored output.
                    clog_warn!("worker {}: {} off scope: {:?}", self.worker.short(), id, subjects);
                    self.progress(id, Some(output))?;
                    return Ok(Step::Next);
                }
                Err(e) if e.is_recoverable() => {
                    clog_debug!("worker {}: completion of {} lost: {}", self.worker.short(), id, e);
                    return Ok(Step::Next);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Heartbeat for `id`. Returns false once the worker no longer owns it.
    fn progress(&self, id: &TaskId, partial: Option<TaskOutput>) -> Result<bool> {
        match self.coordinator.update_progress(id, self.worker, partial) {
            Ok(_) => Ok(true),
            Err(e) if e.is_recoverable() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Sleep for one poll interval. Returns false if cancelled meanwhile.
    async fn pause(&self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(self.poll_interval) => true,
        }
    }
}

/// Nothing in flight and nothing pending with every dependency complete,
/// judged from one listing so a concurrent completion cannot split the view.
fn is_blocked(tasks: &[Task]) -> bool {
    let complete: HashSet<&TaskId> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Complete)
        .map(|t| &t.id)
        .collect();
    !tasks.iter().any(|t| {
        t.status.is_active()
            || (t.status == TaskStatus::Pending
                && t.dependencies.iter().all(|d| complete.contains(d)))
    })
}
