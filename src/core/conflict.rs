//! Conflict records.
//!
//! The conflict list is append-only. Resolving a conflict appends a new
//! record with the same id; the latest record for an id is authoritative.

use crate::core::task::{normalize, Finding, TaskId};
use crate::core::worker::WorkerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    #[default]
    Unresolved,
    ResolvedByEvidence,
    DissentPreserved,
}

impl std::fmt::Display for ConflictStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictStatus::Unresolved => write!(f, "unresolved"),
            ConflictStatus::ResolvedByEvidence => write!(f, "resolved-by-evidence"),
            ConflictStatus::DissentPreserved => write!(f, "dissent-preserved"),
        }
    }
}

/// One side of a contradiction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictingClaim {
    pub task: TaskId,
    pub worker: Option<WorkerId>,
    pub assertion: String,
    pub evidence_weight: f64,
}

impl ConflictingClaim {
    pub fn from_finding(task: TaskId, worker: Option<WorkerId>, finding: &Finding) -> Self {
        Self {
            task,
            worker,
            assertion: finding.assertion.clone(),
            evidence_weight: finding.evidence_weight,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Stable id shared by every record about the same contradiction.
    pub id: String,
    #[serde(default)]
    pub seq: u64,
    pub subject: String,
    pub claims: Vec<ConflictingClaim>,
    #[serde(default)]
    pub status: ConflictStatus,
    #[serde(default)]
    pub rationale: Option<String>,
    /// Assertion that prevailed, when resolved by evidence.
    #[serde(default)]
    pub prevailing: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl ConflictRecord {
    pub fn unresolved(id: impl Into<String>, subject: &str, claims: Vec<ConflictingClaim>) -> Self {
        Self {
            id: id.into(),
            seq: 0,
            subject: subject.to_string(),
            claims,
            status: ConflictStatus::Unresolved,
            rationale: None,
            prevailing: None,
            recorded_at: Utc::now(),
        }
    }

    /// A follow-up record with the given resolution.
    pub fn resolved(
        &self,
        status: ConflictStatus,
        prevailing: Option<String>,
        rationale: impl Into<String>,
    ) -> Self {
        Self {
            id: self.id.clone(),
            seq: 0,
            subject: self.subject.clone(),
            claims: self.claims.clone(),
            status,
            rationale: Some(rationale.into()),
            prevailing,
            recorded_at: Utc::now(),
        }
    }

    pub fn involves(&self, task: &TaskId) -> bool {
        self.claims.iter().any(|c| &c.task == task)
    }

    pub fn is_unresolved(&self) -> bool {
        self.status == ConflictStatus::Unresolved
    }

    /// Stable id for the contradiction on `subject` between `tasks`.
    pub fn id_for(subject: &str, tasks: &[TaskId]) -> String {
        let mut ids: Vec<&str> = tasks.iter().map(TaskId::as_str).collect();
        ids.sort_unstable();
        ids.dedup();
        format!("{}#{}", normalize(subject), ids.join(","))
    }

    /// Weigh the claims and produce the superseding record.
    ///
    /// Evidence weight is summed per distinct assertion. A single heaviest
    /// assertion prevails; a tie at the top preserves the dissent.
    pub fn adjudicate(&self) -> ConflictRecord {
        let mut totals: Vec<(String, String, f64)> = Vec::new();
        for claim in &self.claims {
            let key = normalize(&claim.assertion);
            match totals.iter_mut().find(|(k, _, _)| *k == key) {
                Some(entry) => entry.2 += claim.evidence_weight,
                None => totals.push((key, claim.assertion.clone(), claim.evidence_weight)),
            }
        }
        totals.sort_by(|a, b| b.2.total_cmp(&a.2));

        match totals.as_slice() {
            [] => self.resolved(ConflictStatus::DissentPreserved, None, "no claims to weigh"),
            [(_, only, weight)] => self.resolved(
                ConflictStatus::ResolvedByEvidence,
                Some(only.clone()),
                format!("\"{}\" is the only assertion (weight {:.2})", only, weight),
            ),
            [(_, top, top_weight), (_, next, next_weight), ..] => {
                if (top_weight - next_weight).abs() <= f64::EPSILON {
                    let tied: Vec<String> = totals
                        .iter()
                        .filter(|(_, _, w)| (top_weight - w).abs() <= f64::EPSILON)
                        .map(|(_, a, _)| format!("\"{}\"", a))
                        .collect();
                    self.resolved(
                        ConflictStatus::DissentPreserved,
                        None,
                        format!(
                            "evidence tied at weight {:.2} between {}",
                            top_weight,
                            tied.join(" and ")
                        ),
                    )
                } else {
                    self.resolved(
                        ConflictStatus::ResolvedByEvidence,
                        Some(top.clone()),
                        format!(
                            "\"{}\" carries evidence weight {:.2} against {:.2} for \"{}\"",
                            top, top_weight, next_weight, next
                        ),
                    )
                }
            }
        }
    }
}

/// Collapse an append-only conflict log to the latest record per id,
/// keeping first-appearance order.
pub fn latest_by_id(log: &[ConflictRecord]) -> Vec<ConflictRecord> {
    let mut order: Vec<String> = Vec::new();
    let mut latest: std::collections::HashMap<String, ConflictRecord> =
        std::collections::HashMap::new();
    for record in log {
        if !latest.contains_key(&record.id) {
            order.push(record.id.clone());
        }
        latest.insert(record.id.clone(), record.clone());
    }
    order
        .into_iter()
        .filter_map(|id| latest.remove(&id))
        .collect()
}
