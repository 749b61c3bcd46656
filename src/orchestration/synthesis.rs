//! Synthesis of a finished run.
//!
//! The `SynthesisAggregator` collects the outputs of every completed task,
//! groups their findings by subject, and reconciles contradictions by
//! evidence weight. Contradictions that evidence cannot settle are kept as
//! dissenting opinions rather than silently dropped. Outputs of abandoned
//! tasks are not synthesized; the tasks themselves are listed with their
//! justifications.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::core::conflict::latest_by_id;
use crate::core::{
    ConflictRecord, ConflictStatus, ConflictingClaim, Finding, Payload, Task, TaskId, TaskStatus,
    WorkerId,
};
use crate::error::{Error, Result};
use crate::store::SharedStore;
use crate::{clog, clog_warn};

/// One completed task's payload in the unified deliverable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Contribution {
    pub task: TaskId,
    pub title: String,
    pub worker: Option<WorkerId>,
    pub payload: Payload,
    pub empty_by_design: bool,
}

/// A subject on which every reporting task asserted the same thing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Agreement {
    pub subject: String,
    pub assertion: String,
    pub supporting: Vec<TaskId>,
    pub total_weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedConflict {
    pub conflict: String,
    pub subject: String,
    pub prevailing: String,
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DissentingOpinion {
    pub conflict: String,
    pub subject: String,
    pub positions: Vec<ConflictingClaim>,
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AbandonedTask {
    pub task: TaskId,
    pub title: String,
    pub justification: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct SynthesisReport {
    pub deliverable: Vec<Contribution>,
    pub agreements: Vec<Agreement>,
    pub resolved: Vec<ResolvedConflict>,
    pub dissenting_opinion: Vec<DissentingOpinion>,
    pub abandoned: Vec<AbandonedTask>,
}

impl SynthesisReport {
    /// True only when nothing was abandoned and no dissent remains.
    pub fn succeeded(&self) -> bool {
        self.abandoned.is_empty() && self.dissenting_opinion.is_empty()
    }
}

pub struct SynthesisAggregator {
    store: SharedStore,
}

impl SynthesisAggregator {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Build the final report.
    ///
    /// Contradictions are appended to the conflict log. A conflict already
    /// arbitrated during the run keeps its resolution. Conflicts recorded in
    /// flight that no longer match a contradiction among completed outputs
    /// are closed, so none stays unresolved once the run is synthesized.
    ///
    /// # Errors
    /// `IncompleteRun` if any task is not yet complete or abandoned.
    pub fn synthesize(&self) -> Result<SynthesisReport> {
        let tasks = self.store.list_tasks()?;
        let pending: Vec<TaskId> = tasks
            .iter()
            .filter(|t| !t.is_terminal())
            .map(|t| t.id.clone())
            .collect();
        if !pending.is_empty() {
            clog_warn!("Synthesis refused: {} task(s) not terminal", pending.len());
            return Err(Error::IncompleteRun { pending });
        }

        let complete: Vec<&Task> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Complete)
            .collect();
        let mut report = SynthesisReport {
            deliverable: complete
                .iter()
                .map(|t| {
                    let output = t.output.clone().unwrap_or_default();
                    Contribution {
                        task: t.id.clone(),
                        title: t.title.clone(),
                        worker: t.owner,
                        payload: output.payload,
                        empty_by_design: output.empty_by_design,
                    }
                })
                .collect(),
            abandoned: tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Abandoned)
                .map(|t| AbandonedTask {
                    task: t.id.clone(),
                    title: t.title.clone(),
                    justification: t.justification.clone().unwrap_or_default(),
                })
                .collect(),
            ..Default::default()
        };

        let existing = latest_by_id(&self.store.conflicts()?);
        let mut handled: HashSet<String> = HashSet::new();
        for (_, entries) in group_by_subject(&complete) {
            let Some((_, first)) = entries.first() else {
                continue;
            };
            if !entries.iter().any(|(_, f)| f.contradicts(first)) {
                let mut supporting: Vec<TaskId> = Vec::new();
                for (t, _) in &entries {
                    if !supporting.contains(&t.id) {
                        supporting.push(t.id.clone());
                    }
                }
                report.agreements.push(Agreement {
                    subject: first.subject.clone(),
                    assertion: first.assertion.clone(),
                    supporting,
                    total_weight: entries.iter().map(|(_, f)| f.evidence_weight).sum(),
                });
                continue;
            }

            let task_ids: Vec<TaskId> = entries.iter().map(|(t, _)| t.id.clone()).collect();
            let id = ConflictRecord::id_for(&first.subject, &task_ids);
            handled.insert(id.clone());
            let record = match existing.iter().find(|r| r.id == id) {
                Some(r) if !r.is_unresolved() => r.clone(),
                Some(r) => self.store.append_conflict(r.adjudicate())?,
                None => {
                    let claims = entries
                        .iter()
                        .map(|(t, f)| ConflictingClaim::from_finding(t.id.clone(), t.owner, f))
                        .collect();
                    let fresh = ConflictRecord::unresolved(id, &first.subject, claims);
                    self.store.append_conflict(fresh.adjudicate())?
                }
            };

            let rationale = record.rationale.clone().unwrap_or_default();
            match (record.status, record.prevailing.clone()) {
                (ConflictStatus::ResolvedByEvidence, Some(prevailing)) => {
                    report.resolved.push(ResolvedConflict {
                        conflict: record.id,
                        subject: record.subject,
                        prevailing,
                        rationale,
                    });
                }
                _ => report.dissenting_opinion.push(DissentingOpinion {
                    conflict: record.id,
                    subject: record.subject,
                    positions: record.claims,
                    rationale,
                }),
            }
        }

        let status_of: HashMap<&TaskId, TaskStatus> =
            tasks.iter().map(|t| (&t.id, t.status)).collect();
        for stale in existing
            .iter()
            .filter(|r| r.is_unresolved() && !handled.contains(&r.id))
        {
            self.close_stale(stale, &status_of)?;
        }

        clog!(
            "Synthesis: {} contribution(s), {} agreement(s), {} resolved, {} dissent, {} abandoned",
            report.deliverable.len(),
            report.agreements.len(),
            report.resolved.len(),
            report.dissenting_opinion.len(),
            report.abandoned.len()
        );
        Ok(report)
    }

    /// Settle an in-flight conflict whose task set no longer matches the
    /// completed outputs, weighing only the claims of completed tasks.
    fn close_stale(
        &self,
        stale: &ConflictRecord,
        status_of: &HashMap<&TaskId, TaskStatus>,
    ) -> Result<ConflictRecord> {
        let mut narrowed = stale.clone();
        narrowed
            .claims
            .retain(|c| status_of.get(&c.task) == Some(&TaskStatus::Complete));
        let dropped: Vec<String> = stale
            .claims
            .iter()
            .filter(|c| !narrowed.involves(&c.task))
            .map(|c| c.task.to_string())
            .collect();

        let verdict = narrowed.adjudicate();
        let reason = verdict.rationale.unwrap_or_default();
        let rationale = if dropped.is_empty() {
            format!("closed at synthesis: {}", reason)
        } else {
            format!(
                "closed at synthesis without abandoned {}: {}",
                dropped.join(", "),
                reason
            )
        };
        let closed = stale.resolved(verdict.status, verdict.prevailing, rationale);
        clog_warn!(
            "Conflict {} closed at synthesis: {}",
            stale.id,
            closed.status
        );
        self.store.append_conflict(closed)
    }
}

/// Findings grouped by subject key, in first-appearance order.
fn group_by_subject<'a>(tasks: &[&'a Task]) -> Vec<(String, Vec<(&'a Task, &'a Finding)>)> {
    let mut groups: Vec<(String, Vec<(&Task, &Finding)>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for &task in tasks {
        let Some(output) = &task.output else {
            continue;
        };
        for finding in &output.findings {
            let key = finding.subject_key();
            let slot = match index.get(&key) {
                Some(&slot) => slot,
                None => {
                    groups.push((key.clone(), Vec::new()));
                    index.insert(key, groups.len() - 1);
                    groups.len() - 1
                }
            };
            groups[slot].1.push((task, finding));
        }
    }
    groups
}
