//! The `Run` facade.
//!
//! Wires every coordination component around one shared store and exposes
//! the operations the outside world needs: submitting tasks, spawning
//! workers, periodic supervision, arbitration, budget control and the final
//! report.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::conflict::latest_by_id;
use crate::core::{ConflictRecord, Priority, Task, TaskId, TaskStatus, Worker, WorkerId};
use crate::error::Result;
use crate::orchestration::events::{self, EventSink, RunEvent};
use crate::orchestration::{
    BudgetReport, ClaimCoordinator, CostGovernor, EscalationAction, EscalationEngine,
    LoopSummary, MessageChannel, ProgressMonitor, ScanResult, SynthesisAggregator,
    SynthesisReport, TaskExecutor, WorkerLoop, WorkerPool,
};
use crate::store::{RunMode, SharedStore};
use crate::{clog, clog_debug};

/// Outcome of one supervision cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickReport {
    pub scanned: Vec<ScanResult>,
    pub actions: Vec<EscalationAction>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskLine {
    pub id: TaskId,
    pub title: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub owner: Option<WorkerId>,
    pub held_for: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub mode: RunMode,
    pub fallback_reason: Option<String>,
    pub counts: BTreeMap<TaskStatus, usize>,
    pub tasks: Vec<TaskLine>,
    pub workers: Vec<Worker>,
    pub budget: BudgetReport,
    pub open_conflicts: Vec<ConflictRecord>,
}

/// Final output of a run. Abandoned tasks and preserved dissent are always
/// listed; the run only counts as a success when both are empty.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub succeeded: bool,
    pub synthesis: SynthesisReport,
    pub budget: BudgetReport,
    pub mode: RunMode,
    pub fallback_reason: Option<String>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.succeeded
    }
}

pub struct Run {
    store: SharedStore,
    config: Config,
    coordinator: Arc<ClaimCoordinator>,
    governor: Arc<CostGovernor>,
    pool: Arc<WorkerPool>,
    messaging: Arc<MessageChannel>,
    monitor: ProgressMonitor,
    escalation: Arc<EscalationEngine>,
    synthesis: SynthesisAggregator,
}

impl Run {
    pub fn new(store: SharedStore, config: Config) -> Result<Self> {
        Self::build(store, config, EventSink::none())
    }

    /// Like [`Run::new`], also returning the receiving end of the event stream.
    pub fn with_events(
        store: SharedStore,
        config: Config,
    ) -> Result<(Self, mpsc::Receiver<RunEvent>)> {
        let (sink, rx) = events::channel(events::DEFAULT_EVENT_CAPACITY);
        Ok((Self::build(store, config, sink)?, rx))
    }

    fn build(store: SharedStore, config: Config, events: EventSink) -> Result<Self> {
        config.validate()?;

        // A ceiling already in the store was set for this run and wins over
        // the config file.
        let mut state = store.run_state()?;
        if state.budget_ceiling.is_none() && config.budget.ceiling.is_some() {
            state.budget_ceiling = config.budget.ceiling;
            store.put_run_state(state)?;
        }

        let governor = Arc::new(
            CostGovernor::new(store.clone())
                .with_near_limit_ratio(config.budget.near_limit_ratio)
                .with_events(events.clone()),
        );
        let coordinator = Arc::new(
            ClaimCoordinator::new(store.clone(), governor.clone()).with_events(events.clone()),
        );
        let pool = Arc::new(
            WorkerPool::new(store.clone(), coordinator.clone())
                .with_max_workers(config.workers.max_workers)
                .with_events(events.clone()),
        );
        let messaging = Arc::new(MessageChannel::new(store.clone()));
        let monitor = ProgressMonitor::new(store.clone(), config.monitor.clone());
        let escalation = Arc::new(
            EscalationEngine::new(
                store.clone(),
                coordinator.clone(),
                pool.clone(),
                messaging.clone(),
                &config.monitor,
            )?
            .with_events(events),
        );
        let synthesis = SynthesisAggregator::new(store.clone());

        Ok(Self {
            store,
            config,
            coordinator,
            governor,
            pool,
            messaging,
            monitor,
            escalation,
            synthesis,
        })
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<ClaimCoordinator> {
        &self.coordinator
    }

    pub fn governor(&self) -> &Arc<CostGovernor> {
        &self.governor
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn messaging(&self) -> &Arc<MessageChannel> {
        &self.messaging
    }

    pub fn monitor(&self) -> &ProgressMonitor {
        &self.monitor
    }

    pub fn escalation(&self) -> &Arc<EscalationEngine> {
        &self.escalation
    }

    pub fn submit(&self, task: Task) -> Result<Task> {
        self.coordinator.create(task)
    }

    /// Submit tasks in order, stopping at the first rejection.
    pub fn submit_all(&self, tasks: Vec<Task>) -> Result<Vec<Task>> {
        tasks.into_iter().map(|t| self.submit(t)).collect()
    }

    pub fn tick(&self) -> Result<TickReport> {
        self.tick_at(Utc::now())
    }

    /// One supervision cycle as of `now`: scan, escalate, then record any
    /// contradictions between in-flight outputs.
    pub fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let scanned = self.monitor.scan_at(now)?;
        let mut actions = self.escalation.apply_at(&scanned, now)?;
        let detected = self.monitor.detect_conflicts()?;
        actions.extend(self.escalation.record_conflicts(&detected)?);
        if !actions.is_empty() {
            clog_debug!("tick: {} scanned, {} action(s)", scanned.len(), actions.len());
        }
        Ok(TickReport { scanned, actions })
    }

    /// Tick every `interval` until cancelled or every task is terminal.
    pub async fn supervise(&self, interval: Duration, cancel: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    self.tick()?;
                    if self.store.list_tasks()?.iter().all(|t| t.is_terminal()) {
                        return Ok(());
                    }
                }
            }
        }
    }

    pub fn arbitrate(&self, conflict_id: &str) -> Result<ConflictRecord> {
        self.escalation.arbitrate(conflict_id)
    }

    pub fn arbitrate_all(&self) -> Result<Vec<EscalationAction>> {
        self.escalation.arbitrate_all()
    }

    /// Register a worker and drive it on the runtime until it exits.
    pub fn spawn_worker(
        &self,
        role: &str,
        executor: Arc<dyn TaskExecutor>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<Result<LoopSummary>>> {
        let worker = self.pool.register(role)?;
        let worker_loop = WorkerLoop::new(
            worker.id,
            self.coordinator.clone(),
            self.governor.clone(),
            self.escalation.clone(),
            self.pool.clone(),
            executor,
            cancel,
        )
        .with_intervals(&self.config.workers);
        Ok(tokio::spawn(worker_loop.run()))
    }

    pub fn budget(&self) -> Result<BudgetReport> {
        self.governor.report()
    }

    pub fn acknowledge_checkpoint(&self) -> Result<BudgetReport> {
        self.governor.acknowledge_checkpoint()?;
        self.governor.report()
    }

    pub fn set_ceiling(&self, ceiling: Option<u64>) -> Result<BudgetReport> {
        self.governor.reconfigure(ceiling)?;
        self.governor.report()
    }

    pub fn status(&self) -> Result<StatusReport> {
        let state = self.store.run_state()?;
        let tasks = self.store.list_tasks()?;
        let mut counts = BTreeMap::new();
        for task in &tasks {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        let open_conflicts = latest_by_id(&self.store.conflicts()?)
            .into_iter()
            .filter(|r| r.is_unresolved())
            .collect();
        Ok(StatusReport {
            mode: state.mode,
            fallback_reason: state.fallback_reason,
            counts,
            tasks: tasks
                .into_iter()
                .map(|t| TaskLine {
                    held_for: t.escalation.held_for.clone(),
                    id: t.id,
                    title: t.title,
                    status: t.status,
                    priority: t.priority,
                    owner: t.owner,
                })
                .collect(),
            workers: self.store.list_workers()?,
            budget: self.governor.report()?,
            open_conflicts,
        })
    }

    /// Synthesize the finished run into its final report.
    ///
    /// # Errors
    /// `IncompleteRun` while any task is still pending, claimed or executing.
    pub fn synthesize(&self) -> Result<RunReport> {
        let synthesis = self.synthesis.synthesize()?;
        let state = self.store.run_state()?;
        let report = RunReport {
            succeeded: synthesis.succeeded(),
            synthesis,
            budget: self.governor.report()?,
            mode: state.mode,
            fallback_reason: state.fallback_reason,
        };
        clog!(
            "Run report: succeeded={}, {} abandoned, {} dissenting",
            report.succeeded,
            report.synthesis.abandoned.len(),
            report.synthesis.dissenting_opinion.len()
        );
        Ok(report)
    }
}
