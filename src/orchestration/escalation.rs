//! Escalation of monitor findings.
//!
//! The `EscalationEngine` turns scan results into bounded remediation. Each
//! failure class has a fixed retry allowance, tracked on the task itself so
//! that any process sharing the store sees the same counters:
//!
//! | class                  | action                                          | retries |
//! |------------------------|-------------------------------------------------|---------|
//! | stalled                | clarify, then release after one grace period    | 1       |
//! | double-claim-detected  | log only, the losing write already failed       | 0       |
//! | off-scope              | re-issue with an explicit boundary and release  | 1       |
//! | conflicting outputs    | record, hold until arbitration                  | 0       |
//! | capability unavailable | switch the run to sequential fallback           | 0       |
//!
//! A task whose allowance is spent is abandoned with a justification. A
//! worker that fails twice is retired and its task released.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::MonitorConfig;
use crate::core::conflict::latest_by_id;
use crate::core::{
    ConflictRecord, ConflictStatus, EscalationState, FailureClass, MessageKind, Scope, Task,
    TaskId, TaskPatch, WorkerId,
};
use crate::error::{Error, Result};
use crate::orchestration::coordinator::ClaimCoordinator;
use crate::orchestration::events::{EventSink, RunEvent};
use crate::orchestration::health::{Classification, DetectedConflict, ScanResult};
use crate::orchestration::messaging::MessageChannel;
use crate::orchestration::pool::{WorkerPool, MAX_WORKER_FAILURES};
use crate::store::{RunMode, SharedStore};
use crate::{clog, clog_debug, clog_warn};

/// What escalation did about one finding.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum EscalationAction {
    Clarified {
        task: TaskId,
        worker: WorkerId,
    },
    Released {
        task: TaskId,
        worker: WorkerId,
        class: FailureClass,
        retries: u32,
    },
    Reissued {
        task: TaskId,
        worker: WorkerId,
        boundary: String,
    },
    Abandoned {
        task: TaskId,
        class: FailureClass,
        justification: String,
    },
    DoubleClaimLogged {
        task: TaskId,
        entries: usize,
    },
    ConflictRecorded {
        conflict: String,
        subject: String,
        held: Vec<TaskId>,
    },
    ConflictResolved {
        conflict: String,
        status: ConflictStatus,
    },
    FallbackEntered {
        reason: String,
    },
    WorkerRemoved {
        worker: WorkerId,
        released: Vec<TaskId>,
    },
}

pub struct EscalationEngine {
    store: SharedStore,
    coordinator: Arc<ClaimCoordinator>,
    pool: Arc<WorkerPool>,
    messaging: Arc<MessageChannel>,
    grace_period: chrono::Duration,
    events: EventSink,
}

impl EscalationEngine {
    pub fn new(
        store: SharedStore,
        coordinator: Arc<ClaimCoordinator>,
        pool: Arc<WorkerPool>,
        messaging: Arc<MessageChannel>,
        config: &MonitorConfig,
    ) -> Result<Self> {
        Ok(Self {
            store,
            coordinator,
            pool,
            messaging,
            grace_period: config.grace_period_delta()?,
            events: EventSink::none(),
        })
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn apply(&self, results: &[ScanResult]) -> Result<Vec<EscalationAction>> {
        self.apply_at(results, Utc::now())
    }

    /// Act on scan results as of `now`.
    ///
    /// A result whose task has moved on since the scan is skipped.
    pub fn apply_at(
        &self,
        results: &[ScanResult],
        now: DateTime<Utc>,
    ) -> Result<Vec<EscalationAction>> {
        let mut actions = Vec::new();
        for result in results {
            if result.classification.is_ok() {
                continue;
            }
            let Some((task, owner)) = self.fresh(result)? else {
                clog_debug!("escalation: {} changed since scan, skipping", result.task);
                continue;
            };
            let outcome = match &result.classification {
                Classification::Ok => continue,
                Classification::DoubleClaimDetected { total_entries, .. } => {
                    self.handle_double_claim(&task, *total_entries)
                }
                Classification::OffScope { subjects } => {
                    self.handle_off_scope(&task, owner, subjects)
                }
                Classification::Stalled { idle_secs, .. } => {
                    self.handle_stall(&task, owner, now, *idle_secs)
                }
            };
            match outcome {
                Ok(mut taken) => actions.append(&mut taken),
                Err(e) if e.is_recoverable() => {
                    clog_debug!("escalation: {} moved during handling: {}", task.id, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(actions)
    }

    fn fresh(&self, result: &ScanResult) -> Result<Option<(Task, WorkerId)>> {
        let task = self.store.read(&result.task)?;
        let Some(owner) = task.owner else {
            return Ok(None);
        };
        if !task.status.is_active() || result.owner != Some(owner) {
            return Ok(None);
        }
        Ok(Some((task, owner)))
    }

    fn handle_stall(
        &self,
        task: &Task,
        owner: WorkerId,
        now: DateTime<Utc>,
        idle_secs: i64,
    ) -> Result<Vec<EscalationAction>> {
        let mut escalation = task.escalation.clone();
        // Progress after the clarification makes this a fresh stall.
        let nudged_at = escalation
            .stall_nudged_at
            .filter(|at| task.last_progress.map(|p| p <= *at).unwrap_or(true));

        let Some(nudged_at) = nudged_at else {
            escalation.stall_nudged_at = Some(now);
            self.coordinator.annotate(task, escalation)?;
            self.messaging.notify(
                owner,
                MessageKind::Clarification,
                &task.id,
                format!(
                    "No progress on \"{}\" for {}s. Report progress or release the task.",
                    task.title, idle_secs
                ),
            )?;
            self.escalated(task, FailureClass::Stalled, "clarification sent");
            return Ok(vec![EscalationAction::Clarified {
                task: task.id.clone(),
                worker: owner,
            }]);
        };

        if now - nudged_at < self.grace_period {
            return Ok(Vec::new());
        }

        escalation.stall_nudged_at = None;
        let mut actions = Vec::new();
        if escalation.exhausted(FailureClass::Stalled) {
            let justification = format!(
                "stalled: no progress for {}s after clarification, {} retry already used",
                idle_secs,
                escalation.retries(FailureClass::Stalled)
            );
            actions.push(self.abandon(
                task,
                owner,
                FailureClass::Stalled,
                justification,
                escalation,
            )?);
        } else {
            let retries = escalation.increment(FailureClass::Stalled);
            self.coordinator.release_with(
                &task.id,
                owner,
                "stalled after clarification",
                TaskPatch::default().with_escalation(escalation),
            )?;
            self.escalated(task, FailureClass::Stalled, "released for reassignment");
            actions.push(EscalationAction::Released {
                task: task.id.clone(),
                worker: owner,
                class: FailureClass::Stalled,
                retries,
            });
        }
        actions.extend(self.note_failure(owner, &FailureClass::Stalled.to_string())?);
        Ok(actions)
    }

    fn handle_off_scope(
        &self,
        task: &Task,
        owner: WorkerId,
        subjects: &[String],
    ) -> Result<Vec<EscalationAction>> {
        let mut escalation = task.escalation.clone();
        let mut actions = Vec::new();
        if escalation.exhausted(FailureClass::OffScope) {
            let justification = format!(
                "off-scope output on {} after re-issue with an explicit boundary",
                subjects.join(", ")
            );
            actions.push(self.abandon(
                task,
                owner,
                FailureClass::OffScope,
                justification,
                escalation,
            )?);
        } else {
            let boundary = scope_boundary(&task.scope, subjects);
            escalation.increment(FailureClass::OffScope);
            self.coordinator.release_with(
                &task.id,
                owner,
                "off-scope output",
                TaskPatch::default()
                    .with_escalation(escalation)
                    .with_scope_boundary(boundary.clone())
                    .clear_output(),
            )?;
            self.messaging
                .notify(owner, MessageKind::ScopeReissue, &task.id, boundary.clone())?;
            self.escalated(task, FailureClass::OffScope, "re-issued with scope boundary");
            actions.push(EscalationAction::Reissued {
                task: task.id.clone(),
                worker: owner,
                boundary,
            });
        }
        actions.extend(self.note_failure(owner, &FailureClass::OffScope.to_string())?);
        Ok(actions)
    }

    fn handle_double_claim(&self, task: &Task, total: usize) -> Result<Vec<EscalationAction>> {
        let mut escalation = task.escalation.clone();
        let new_entries = total.saturating_sub(escalation.double_claims_logged);
        escalation.double_claims_logged = total;
        self.coordinator.annotate(task, escalation)?;
        clog_warn!(
            "Double claim on {}: {} conflicting write(s) rejected, owner unchanged",
            task.id,
            new_entries
        );
        self.escalated(task, FailureClass::DoubleClaim, "logged");
        Ok(vec![EscalationAction::DoubleClaimLogged {
            task: task.id.clone(),
            entries: new_entries,
        }])
    }

    fn abandon(
        &self,
        task: &Task,
        owner: WorkerId,
        class: FailureClass,
        justification: String,
        escalation: EscalationState,
    ) -> Result<EscalationAction> {
        self.coordinator.abandon_with(
            &task.id,
            owner,
            &justification,
            TaskPatch::default().with_escalation(escalation),
        )?;
        self.escalated(task, class, "abandoned");
        Ok(EscalationAction::Abandoned {
            task: task.id.clone(),
            class,
            justification,
        })
    }

    /// Record newly detected contradictions and hold the in-flight tasks
    /// involved until arbitration.
    pub fn record_conflicts(
        &self,
        detected: &[DetectedConflict],
    ) -> Result<Vec<EscalationAction>> {
        let known: HashSet<String> = self
            .store
            .conflicts()?
            .into_iter()
            .map(|r| r.id)
            .collect();

        let mut actions = Vec::new();
        for conflict in detected {
            if known.contains(&conflict.id) {
                continue;
            }
            let record = self.store.append_conflict(conflict.to_record())?;
            let mut held = Vec::new();
            for id in &conflict.in_flight {
                let task = self.store.read(id)?;
                if !task.status.is_active() {
                    continue;
                }
                if task.escalation.held_for.is_none() {
                    let mut escalation = task.escalation.clone();
                    escalation.held_for = Some(record.id.clone());
                    match self.coordinator.annotate(&task, escalation) {
                        Ok(_) => {}
                        Err(e) if e.is_recoverable() => continue,
                        Err(e) => return Err(e),
                    }
                }
                if let Some(owner) = task.owner {
                    self.messaging.notify(
                        owner,
                        MessageKind::Arbitration,
                        id,
                        format!(
                            "Your output on \"{}\" contradicts another worker. Completion is held until conflict {} is arbitrated.",
                            conflict.subject, record.id
                        ),
                    )?;
                }
                held.push(id.clone());
            }
            clog_warn!(
                "Conflict {} recorded on \"{}\", holding {} task(s)",
                record.id,
                record.subject,
                held.len()
            );
            self.events.emit(RunEvent::ConflictRecorded {
                conflict: record.id.clone(),
                subject: record.subject.clone(),
            });
            actions.push(EscalationAction::ConflictRecorded {
                conflict: record.id,
                subject: record.subject,
                held,
            });
        }
        Ok(actions)
    }

    /// Resolve a recorded conflict by evidence and lift the holds it placed.
    ///
    /// Already-resolved conflicts are returned unchanged.
    pub fn arbitrate(&self, conflict_id: &str) -> Result<ConflictRecord> {
        let latest = latest_by_id(&self.store.conflicts()?);
        let record = latest
            .iter()
            .find(|r| r.id == conflict_id)
            .ok_or_else(|| Error::Validation(format!("unknown conflict {}", conflict_id)))?;
        if !record.is_unresolved() {
            return Ok(record.clone());
        }

        let resolved = self.store.append_conflict(record.adjudicate())?;
        let rationale = resolved.rationale.clone().unwrap_or_default();
        let still_open: Vec<&ConflictRecord> = latest
            .iter()
            .filter(|r| r.id != conflict_id && r.is_unresolved())
            .collect();

        for task in self.store.list_tasks()? {
            if !task.status.is_active() || task.escalation.held_for.as_deref() != Some(conflict_id)
            {
                continue;
            }
            let mut escalation = task.escalation.clone();
            escalation.held_for = still_open
                .iter()
                .find(|r| r.involves(&task.id))
                .map(|r| r.id.clone());
            match self.coordinator.annotate(&task, escalation) {
                Ok(_) => {}
                Err(e) if e.is_recoverable() => continue,
                Err(e) => return Err(e),
            }
            if let Some(owner) = task.owner {
                self.messaging.notify(
                    owner,
                    MessageKind::Arbitration,
                    &task.id,
                    format!("Conflict {} {}: {}", conflict_id, resolved.status, rationale),
                )?;
            }
        }

        clog!(
            "Conflict {} arbitrated: {} ({})",
            conflict_id,
            resolved.status,
            rationale
        );
        self.events.emit(RunEvent::ConflictResolved {
            conflict: resolved.id.clone(),
            status: resolved.status,
        });
        Ok(resolved)
    }

    /// Arbitrate every conflict that is still unresolved.
    pub fn arbitrate_all(&self) -> Result<Vec<EscalationAction>> {
        let open: Vec<String> = latest_by_id(&self.store.conflicts()?)
            .into_iter()
            .filter(|r| r.is_unresolved())
            .map(|r| r.id)
            .collect();
        let mut actions = Vec::new();
        for id in open {
            let record = self.arbitrate(&id)?;
            actions.push(EscalationAction::ConflictResolved {
                conflict: record.id,
                status: record.status,
            });
        }
        Ok(actions)
    }

    /// A worker found it cannot execute at all.
    ///
    /// The first report switches the run to sequential fallback and releases
    /// the task so it can run there. A report while already in fallback
    /// abandons the task: there is nothing left to fall back to.
    pub fn report_capability_unavailable(
        &self,
        worker: WorkerId,
        task: Option<&TaskId>,
        reason: &str,
    ) -> Result<Vec<EscalationAction>> {
        let class = FailureClass::CapabilityUnavailable;
        let mut actions = Vec::new();
        let mut state = self.store.run_state()?;
        let already_sequential = state.mode == RunMode::SequentialFallback;

        if !already_sequential {
            state.mode = RunMode::SequentialFallback;
            state.fallback_reason = Some(reason.to_string());
            self.store.put_run_state(state)?;
            clog_warn!("Run switched to sequential fallback: {}", reason);
            self.events.emit(RunEvent::ModeChanged {
                mode: RunMode::SequentialFallback,
                reason: reason.to_string(),
            });
            actions.push(EscalationAction::FallbackEntered {
                reason: reason.to_string(),
            });
        }

        if let Some(id) = task {
            let current = self.store.read(id)?;
            if current.is_owned_by(&worker) {
                let mut escalation = current.escalation.clone();
                if already_sequential {
                    let justification = format!(
                        "execution capability unavailable in sequential fallback: {}",
                        reason
                    );
                    actions.push(self.abandon(
                        &current,
                        worker,
                        class,
                        justification,
                        escalation,
                    )?);
                } else {
                    let retries = escalation.increment(class);
                    self.coordinator.release_with(
                        id,
                        worker,
                        &format!("capability unavailable: {}", reason),
                        TaskPatch::default().with_escalation(escalation),
                    )?;
                    self.escalated(&current, class, "released for sequential fallback");
                    actions.push(EscalationAction::Released {
                        task: id.clone(),
                        worker,
                        class,
                        retries,
                    });
                }
            }
        }

        actions.extend(self.note_failure(worker, &class.to_string())?);
        Ok(actions)
    }

    /// Execution failed for a reason the worker could name. The task goes
    /// back to pending and the failure counts against the worker.
    pub fn report_execution_failure(
        &self,
        worker: WorkerId,
        task: &TaskId,
        reason: &str,
    ) -> Result<Vec<EscalationAction>> {
        match self
            .coordinator
            .release(task, worker, &format!("execution failed: {}", reason))
        {
            Ok(_) => {}
            Err(e) if e.is_recoverable() => {
                clog_debug!("escalation: release of {} skipped: {}", task, e);
            }
            Err(e) => return Err(e),
        }
        self.note_failure(worker, reason)
    }

    fn note_failure(&self, worker: WorkerId, cause: &str) -> Result<Vec<EscalationAction>> {
        let failures = match self.pool.record_failure(&worker) {
            Ok(n) => n,
            Err(Error::WorkerNotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        if failures < MAX_WORKER_FAILURES || self.pool.get(&worker)?.is_removed() {
            return Ok(Vec::new());
        }
        let released = self.pool.retire(
            &worker,
            &format!("failed {} times, last: {}", failures, cause),
        )?;
        Ok(vec![EscalationAction::WorkerRemoved { worker, released }])
    }

    fn escalated(&self, task: &Task, class: FailureClass, action: &str) {
        clog_warn!("Escalation on {} ({}): {}", task.id, class, action);
        self.events.emit(RunEvent::Escalated {
            task: task.id.clone(),
            class,
            action: action.to_string(),
        });
    }
}

fn scope_boundary(scope: &Scope, outside: &[String]) -> String {
    format!(
        "Report only on: {}. Out of scope: {}.",
        scope.subjects.join(", "),
        outside.join(", ")
    )
}
