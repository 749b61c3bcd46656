//! Cost governance.
//!
//! The `CostGovernor` keeps the run inside its resource ceiling. Spending is
//! recorded in the store's append-only ledger and totals are always derived
//! from it, so every process sharing the store sees the same numbers.
//!
//! Thresholds:
//! - below the near-limit ratio (80% by default): claims are admitted
//! - at or above it: a human checkpoint must be acknowledged first
//! - at or above the ceiling: no new claims until the ceiling is raised;
//!   tasks already in flight may finish

use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::DEFAULT_NEAR_LIMIT_RATIO;
use crate::core::{LedgerEntry, TaskId, WorkerId};
use crate::error::{Error, Result};
use crate::orchestration::events::{EventSink, RunEvent};
use crate::store::SharedStore;
use crate::{clog, clog_debug, clog_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetStatus {
    WithinBudget,
    NearLimit,
    OverBudget,
}

impl std::fmt::Display for BudgetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BudgetStatus::WithinBudget => write!(f, "within-budget"),
            BudgetStatus::NearLimit => write!(f, "near-limit"),
            BudgetStatus::OverBudget => write!(f, "over-budget"),
        }
    }
}

/// Snapshot of spending for status output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetReport {
    pub status: BudgetStatus,
    pub spent: u64,
    pub ceiling: Option<u64>,
    pub checkpoint_cleared: bool,
    pub per_worker: BTreeMap<WorkerId, u64>,
}

pub struct CostGovernor {
    store: SharedStore,
    near_limit_ratio: f64,
    events: EventSink,
}

impl CostGovernor {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            near_limit_ratio: DEFAULT_NEAR_LIMIT_RATIO,
            events: EventSink::none(),
        }
    }

    pub fn with_near_limit_ratio(mut self, ratio: f64) -> Self {
        self.near_limit_ratio = ratio;
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Append a ledger entry and charge the worker.
    ///
    /// Spending is never refused here: work already admitted is paid for.
    pub fn record(&self, worker: WorkerId, task: &TaskId, units: u64) -> Result<LedgerEntry> {
        let before = self.check_budget()?;
        let entry = self
            .store
            .append_ledger(LedgerEntry::new(worker, task.clone(), units))?;
        match self
            .store
            .update_worker(&worker, &mut |w| w.cost_consumed += units)
        {
            Ok(_) | Err(Error::WorkerNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        clog_debug!(
            "governor: {} unit(s) for task {} by worker {}",
            units,
            task,
            worker.short()
        );

        let after = self.check_budget()?;
        if after != before {
            let spent = self.total_spent()?;
            let ceiling = self.ceiling()?.unwrap_or(0);
            clog_warn!(
                "governor: budget {} ({} of {} units)",
                after,
                spent,
                ceiling
            );
            self.events.emit(RunEvent::BudgetThreshold {
                status: after,
                spent,
                ceiling,
            });
        }
        Ok(entry)
    }

    pub fn total_spent(&self) -> Result<u64> {
        Ok(self.store.ledger()?.iter().map(|e| e.units).sum())
    }

    pub fn spent_by(&self, worker: &WorkerId) -> Result<u64> {
        Ok(self
            .store
            .ledger()?
            .iter()
            .filter(|e| &e.worker == worker)
            .map(|e| e.units)
            .sum())
    }

    pub fn per_worker(&self) -> Result<BTreeMap<WorkerId, u64>> {
        let mut totals = BTreeMap::new();
        for entry in self.store.ledger()? {
            *totals.entry(entry.worker).or_insert(0) += entry.units;
        }
        Ok(totals)
    }

    pub fn ceiling(&self) -> Result<Option<u64>> {
        Ok(self.store.run_state()?.budget_ceiling)
    }

    pub fn check_budget(&self) -> Result<BudgetStatus> {
        let spent = self.total_spent()?;
        Ok(match self.ceiling()? {
            Some(ceiling) => classify(spent, ceiling, self.near_limit_ratio),
            None => BudgetStatus::WithinBudget,
        })
    }

    pub fn report(&self) -> Result<BudgetReport> {
        let state = self.store.run_state()?;
        Ok(BudgetReport {
            status: self.check_budget()?,
            spent: self.total_spent()?,
            ceiling: state.budget_ceiling,
            checkpoint_cleared: state.checkpoint_cleared_at.is_some(),
            per_worker: self.per_worker()?,
        })
    }

    /// Decide whether a new claim may be admitted.
    ///
    /// # Errors
    /// `BudgetExceeded` at or over the ceiling, `CheckpointRequired` in the
    /// near-limit band until a checkpoint has been acknowledged.
    pub fn admit(&self) -> Result<()> {
        let state = self.store.run_state()?;
        let Some(ceiling) = state.budget_ceiling else {
            return Ok(());
        };
        let spent = self.total_spent()?;
        match classify(spent, ceiling, self.near_limit_ratio) {
            BudgetStatus::WithinBudget => Ok(()),
            BudgetStatus::NearLimit if state.checkpoint_cleared_at.is_some() => Ok(()),
            BudgetStatus::NearLimit => Err(Error::CheckpointRequired { spent, ceiling }),
            BudgetStatus::OverBudget => Err(Error::BudgetExceeded { spent, ceiling }),
        }
    }

    /// Record that a human reviewed spending at the near-limit checkpoint.
    pub fn acknowledge_checkpoint(&self) -> Result<()> {
        let spent = self.total_spent()?;
        let mut state = self.store.run_state()?;
        state.checkpoint_cleared_at = Some(spent);
        self.store.put_run_state(state)?;
        clog!("governor: checkpoint acknowledged at {} units", spent);
        Ok(())
    }

    /// Set a new ceiling, or remove it with `None`. Clears any checkpoint.
    pub fn reconfigure(&self, ceiling: Option<u64>) -> Result<()> {
        let mut state = self.store.run_state()?;
        state.budget_ceiling = ceiling;
        state.checkpoint_cleared_at = None;
        self.store.put_run_state(state)?;
        clog!("governor: ceiling set to {:?}", ceiling);
        Ok(())
    }
}

fn classify(spent: u64, ceiling: u64, near_limit_ratio: f64) -> BudgetStatus {
    if spent >= ceiling {
        BudgetStatus::OverBudget
    } else if spent as f64 >= ceiling as f64 * near_limit_ratio {
        BudgetStatus::NearLimit
    } else {
        BudgetStatus::WithinBudget
    }
}
