//! Progress monitoring for in-flight tasks.
//!
//! The `ProgressMonitor` reads the store and classifies every claimed or
//! executing task. It never writes: results are handed to the
//! `EscalationEngine`, which decides what to do about them.
//!
//! ## Classifications
//!
//! Checked in this order, first match wins:
//! - `DoubleClaimDetected` when the store logged a compare-and-set conflict
//!   for the task that escalation has not yet seen
//! - `OffScope` when the partial output reports on subjects outside the
//!   task's declared scope
//! - `Stalled` when the task has made no progress for longer than the stall
//!   multiple of its expected duration
//! - `Ok` otherwise

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::MonitorConfig;
use crate::core::{
    ConflictRecord, ConflictingClaim, Finding, Task, TaskId, TaskStatus, WorkerId,
};
use crate::error::Result;
use crate::store::SharedStore;
use crate::clog_debug;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "class")]
pub enum Classification {
    Ok,
    Stalled {
        /// Seconds since the last recorded progress.
        idle_secs: i64,
        threshold_secs: i64,
    },
    OffScope {
        subjects: Vec<String>,
    },
    DoubleClaimDetected {
        /// Conflict log entries not yet acknowledged.
        new_entries: usize,
        total_entries: usize,
    },
}

impl Classification {
    pub fn is_ok(&self) -> bool {
        matches!(self, Classification::Ok)
    }
}

/// Result of scanning one in-flight task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanResult {
    pub task: TaskId,
    pub status: TaskStatus,
    pub owner: Option<WorkerId>,
    pub classification: Classification,
}

/// A contradiction between outputs that are already in the store.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedConflict {
    pub id: String,
    pub subject: String,
    pub claims: Vec<ConflictingClaim>,
    /// Involved tasks that are still claimed or executing.
    pub in_flight: Vec<TaskId>,
}

impl DetectedConflict {
    pub fn to_record(&self) -> ConflictRecord {
        ConflictRecord::unresolved(self.id.clone(), &self.subject, self.claims.clone())
    }
}

pub struct ProgressMonitor {
    store: SharedStore,
    config: MonitorConfig,
}

impl ProgressMonitor {
    pub fn new(store: SharedStore, config: MonitorConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn scan(&self) -> Result<Vec<ScanResult>> {
        self.scan_at(Utc::now())
    }

    /// Classify every in-flight task as of `now`.
    pub fn scan_at(&self, now: DateTime<Utc>) -> Result<Vec<ScanResult>> {
        let mut results = Vec::new();
        for task in self.store.list_tasks()? {
            if !task.status.is_active() {
                continue;
            }
            let classification = self.classify(&task, now)?;
            if !classification.is_ok() {
                clog_debug!("monitor: task {} is {:?}", task.id, classification);
            }
            results.push(ScanResult {
                task: task.id.clone(),
                status: task.status,
                owner: task.owner,
                classification,
            });
        }
        Ok(results)
    }

    /// Time without progress after which `task` counts as stalled.
    pub fn stall_threshold(&self, task: &Task) -> chrono::Duration {
        let expected = task
            .expected_duration_secs
            .unwrap_or(self.config.default_expected_secs);
        let millis = expected as f64 * self.config.stall_multiplier * 1000.0;
        chrono::Duration::milliseconds(millis as i64)
    }

    fn classify(&self, task: &Task, now: DateTime<Utc>) -> Result<Classification> {
        let total = self.store.cas_conflicts(&task.id)?.len();
        if total > task.escalation.double_claims_logged {
            return Ok(Classification::DoubleClaimDetected {
                new_entries: total - task.escalation.double_claims_logged,
                total_entries: total,
            });
        }

        if let Some(output) = &task.output {
            let outside = task.scope.violations(&output.findings);
            if !outside.is_empty() {
                return Ok(Classification::OffScope { subjects: outside });
            }
        }

        let last = task
            .last_progress
            .or(task.claimed_at)
            .unwrap_or(task.created_at);
        let idle = now - last;
        let threshold = self.stall_threshold(task);
        if idle > threshold {
            return Ok(Classification::Stalled {
                idle_secs: idle.num_seconds(),
                threshold_secs: threshold.num_seconds(),
            });
        }
        Ok(Classification::Ok)
    }

    /// Find contradictions among outputs in the store that involve at least
    /// one in-flight task.
    ///
    /// Contradictions between tasks that are all complete are left to
    /// synthesis.
    pub fn detect_conflicts(&self) -> Result<Vec<DetectedConflict>> {
        let tasks = self.store.list_tasks()?;
        let mut by_subject: Vec<(String, Vec<(&Task, &Finding)>)> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for task in &tasks {
            if !(task.status.is_active() || task.status == TaskStatus::Complete) {
                continue;
            }
            let Some(output) = &task.output else { continue };
            for finding in &output.findings {
                let key = finding.subject_key();
                let slot = *index.entry(key.clone()).or_insert_with(|| {
                    by_subject.push((key, Vec::new()));
                    by_subject.len() - 1
                });
                by_subject[slot].1.push((task, finding));
            }
        }

        let mut detected = Vec::new();
        for (_, entries) in by_subject {
            let Some((_, first)) = entries.first() else { continue };
            if !entries.iter().any(|(_, f)| f.contradicts(first)) {
                continue;
            }
            let mut in_flight: Vec<TaskId> = entries
                .iter()
                .filter(|(t, _)| t.status.is_active())
                .map(|(t, _)| t.id.clone())
                .collect();
            in_flight.dedup();
            if in_flight.is_empty() {
                continue;
            }
            let task_ids: Vec<TaskId> = entries.iter().map(|(t, _)| t.id.clone()).collect();
            detected.push(DetectedConflict {
                id: ConflictRecord::id_for(&first.subject, &task_ids),
                subject: first.subject.clone(),
                claims: entries
                    .iter()
                    .map(|(t, f)| ConflictingClaim::from_finding(t.id.clone(), t.owner, f))
                    .collect(),
                in_flight,
            });
        }
        Ok(detected)
    }
}
