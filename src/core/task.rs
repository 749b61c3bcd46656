//! Task data model for the coordination store.
//!
//! Tasks are the atomic units of work claimed by workers. Each task tracks
//! its lifecycle status, current owner, progress timestamp, output, and the
//! escalation counters that bound how often it may be retried.

use crate::core::worker::WorkerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Unique identifier for a task.
///
/// Task producers usually pick readable ids (`"schema"`, `"api-auth"`);
/// `TaskId::generate()` is available when they don't care.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Create a fresh identifier backed by a UUID v4.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// First 8 characters of the id for display.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Scheduling priority. Declaration order is preference order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// Task status in its lifecycle.
///
/// `pending → claimed → executing → complete`, with `claimed`/`executing`
/// able to fall back to `pending` (release) or end in `abandoned`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed.
    #[default]
    Pending,
    /// Owned by a worker that has not started yet.
    Claimed,
    /// Owned by a worker that is executing it.
    Executing,
    /// Finished with an accepted output. Terminal.
    Complete,
    /// Given up on after escalation. Terminal.
    Abandoned,
}

impl TaskStatus {
    /// Check if the status is terminal (`complete` or `abandoned`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Abandoned)
    }

    /// Check if the status requires an owner (`claimed` or `executing`).
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Claimed | TaskStatus::Executing)
    }

    /// Check whether `self → next` is an edge of the state machine.
    ///
    /// Self-loops on active states are allowed: they carry heartbeats and
    /// escalation bookkeeping without changing ownership.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Claimed)
                | (Claimed, Executing)
                | (Executing, Complete)
                | (Claimed, Pending)
                | (Executing, Pending)
                | (Claimed, Abandoned)
                | (Executing, Abandoned)
                | (Claimed, Claimed)
                | (Executing, Executing)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Claimed => write!(f, "claimed"),
            TaskStatus::Executing => write!(f, "executing"),
            TaskStatus::Complete => write!(f, "complete"),
            TaskStatus::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// Opaque content carried through the core without inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "kind", content = "data")]
pub enum Payload {
    #[default]
    Empty,
    Text(String),
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

impl Payload {
    pub fn text(s: impl Into<String>) -> Self {
        Payload::Text(s.into())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Empty => true,
            Payload::Text(s) => s.trim().is_empty(),
            Payload::Json(v) => v.is_null(),
            Payload::Bytes(b) => b.is_empty(),
        }
    }
}

/// A claim a worker makes about a subject, with the weight of its evidence.
///
/// Findings are the only part of an output the core reads; synthesis groups
/// them by subject and compares assertions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub subject: String,
    pub assertion: String,
    #[serde(default)]
    pub evidence_weight: f64,
}

impl Finding {
    pub fn new(subject: impl Into<String>, assertion: impl Into<String>, weight: f64) -> Self {
        Self {
            subject: subject.into(),
            assertion: assertion.into(),
            evidence_weight: weight,
        }
    }

    /// Subject key used for grouping: trimmed and lowercased.
    pub fn subject_key(&self) -> String {
        normalize(&self.subject)
    }

    /// Assertion key used for comparison: trimmed, lowercased, whitespace collapsed.
    pub fn assertion_key(&self) -> String {
        normalize(&self.assertion)
    }

    /// Two findings contradict when they talk about the same subject
    /// and assert different things.
    pub fn contradicts(&self, other: &Finding) -> bool {
        self.subject_key() == other.subject_key() && self.assertion_key() != other.assertion_key()
    }
}

pub(crate) fn normalize(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Output written by the owning worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TaskOutput {
    #[serde(default)]
    pub payload: Payload,
    #[serde(default)]
    pub findings: Vec<Finding>,
    /// Set when an empty output is the intended result.
    #[serde(default)]
    pub empty_by_design: bool,
}

impl TaskOutput {
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            ..Default::default()
        }
    }

    /// An output that is deliberately empty.
    pub fn empty_by_design() -> Self {
        Self {
            empty_by_design: true,
            ..Default::default()
        }
    }

    pub fn with_finding(mut self, finding: Finding) -> Self {
        self.findings.push(finding);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty() && self.findings.is_empty()
    }

    /// Whether this output may complete a task.
    pub fn is_acceptable(&self) -> bool {
        !self.is_empty() || self.empty_by_design
    }
}

/// The declared scope of a task.
///
/// The descriptor is opaque. `subjects` lists the finding subjects the task
/// may report on; an empty list leaves the task unrestricted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Scope {
    #[serde(default)]
    pub descriptor: Payload,
    #[serde(default)]
    pub subjects: Vec<String>,
    /// Explicit boundary attached when the task is re-issued after going off-scope.
    #[serde(default)]
    pub boundary: Option<String>,
}

impl Scope {
    pub fn new(descriptor: Payload) -> Self {
        Self {
            descriptor,
            ..Default::default()
        }
    }

    pub fn with_subjects<I, S>(mut self, subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subjects = subjects.into_iter().map(Into::into).collect();
        self
    }

    pub fn admits(&self, subject: &str) -> bool {
        if self.subjects.is_empty() {
            return true;
        }
        let key = normalize(subject);
        self.subjects.iter().any(|s| normalize(s) == key)
    }

    /// Subjects in `findings` that fall outside this scope.
    pub fn violations(&self, findings: &[Finding]) -> Vec<String> {
        findings
            .iter()
            .filter(|f| !self.admits(&f.subject))
            .map(|f| f.subject.clone())
            .collect()
    }
}

/// Failure classes the escalation ladder knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Stalled,
    DoubleClaim,
    OffScope,
    ConflictingOutputs,
    CapabilityUnavailable,
}

impl FailureClass {
    /// Retries allowed before the task is abandoned.
    pub fn max_retries(&self) -> u32 {
        match self {
            FailureClass::Stalled | FailureClass::OffScope => 1,
            FailureClass::DoubleClaim
            | FailureClass::ConflictingOutputs
            | FailureClass::CapabilityUnavailable => 0,
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureClass::Stalled => write!(f, "stalled"),
            FailureClass::DoubleClaim => write!(f, "double-claim-detected"),
            FailureClass::OffScope => write!(f, "off-scope"),
            FailureClass::ConflictingOutputs => write!(f, "conflicting-outputs"),
            FailureClass::CapabilityUnavailable => write!(f, "capability-unavailable"),
        }
    }
}

/// Escalation bookkeeping stored on the task record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EscalationState {
    /// Retries consumed per failure class.
    #[serde(default)]
    pub retries: HashMap<FailureClass, u32>,
    /// When the owner was last sent a clarifying message about a stall.
    #[serde(default)]
    pub stall_nudged_at: Option<DateTime<Utc>>,
    /// Number of CAS conflict log entries already acknowledged.
    #[serde(default)]
    pub double_claims_logged: usize,
    /// Conflict id this task is held on until arbitration.
    #[serde(default)]
    pub held_for: Option<String>,
}

impl EscalationState {
    pub fn retries(&self, class: FailureClass) -> u32 {
        self.retries.get(&class).copied().unwrap_or(0)
    }

    /// Increment the retry count for a class, returning the new count.
    pub fn increment(&mut self, class: FailureClass) -> u32 {
        let count = self.retries.entry(class).or_insert(0);
        *count += 1;
        *count
    }

    pub fn exhausted(&self, class: FailureClass) -> bool {
        self.retries(class) >= class.max_retries()
    }
}

/// Status and owner, the pair every compare-and-set is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub status: TaskStatus,
    pub owner: Option<WorkerId>,
}

impl TaskSnapshot {
    pub fn new(status: TaskStatus, owner: Option<WorkerId>) -> Self {
        Self { status, owner }
    }

    pub fn pending() -> Self {
        Self::new(TaskStatus::Pending, None)
    }
}

impl std::fmt::Display for TaskSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.owner {
            Some(owner) => write!(f, "{} by {}", self.status, owner.short()),
            None => write!(f, "{} (unowned)", self.status),
        }
    }
}

/// Field changes applied together with a compare-and-set.
///
/// Unset fields are left as they are.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub last_progress: Option<DateTime<Utc>>,
    /// `Some(None)` clears the output.
    pub output: Option<Option<TaskOutput>>,
    pub justification: Option<String>,
    pub escalation: Option<EscalationState>,
    pub scope_boundary: Option<String>,
}

impl TaskPatch {
    pub fn progress(at: DateTime<Utc>) -> Self {
        Self {
            last_progress: Some(at),
            ..Default::default()
        }
    }

    pub fn with_output(mut self, output: TaskOutput) -> Self {
        self.output = Some(Some(output));
        self
    }

    pub fn clear_output(mut self) -> Self {
        self.output = Some(None);
        self
    }

    pub fn with_justification(mut self, justification: impl Into<String>) -> Self {
        self.justification = Some(justification.into());
        self
    }

    pub fn with_escalation(mut self, escalation: EscalationState) -> Self {
        self.escalation = Some(escalation);
        self
    }

    pub fn with_scope_boundary(mut self, boundary: impl Into<String>) -> Self {
        self.scope_boundary = Some(boundary.into());
        self
    }
}

/// A single task in the coordination store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Human-readable title.
    pub title: String,
    /// Declared scope.
    #[serde(default)]
    pub scope: Scope,
    /// Tasks that must be complete before this one is eligible.
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub status: TaskStatus,
    /// Worker currently holding the task.
    #[serde(default)]
    pub owner: Option<WorkerId>,
    /// Creation order, assigned by the store.
    #[serde(default)]
    pub seq: u64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_progress: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Expected execution time; the stall threshold is a multiple of it.
    #[serde(default)]
    pub expected_duration_secs: Option<u64>,
    #[serde(default)]
    pub output: Option<TaskOutput>,
    /// Why the task was abandoned.
    #[serde(default)]
    pub justification: Option<String>,
    #[serde(default)]
    pub escalation: EscalationState,
}

impl Task {
    /// Create a pending task with no dependencies and default priority.
    pub fn new(id: impl Into<TaskId>, title: &str) -> Self {
        Self {
            id: id.into(),
            title: title.to_string(),
            scope: Scope::default(),
            dependencies: Vec::new(),
            priority: Priority::default(),
            status: TaskStatus::Pending,
            owner: None,
            seq: 0,
            created_at: Utc::now(),
            claimed_at: None,
            last_progress: None,
            finished_at: None,
            expected_duration_secs: None,
            output: None,
            justification: None,
            escalation: EscalationState::default(),
        }
    }

    pub fn with_dependency(mut self, dep: impl Into<TaskId>) -> Self {
        let dep = dep.into();
        if !self.dependencies.contains(&dep) {
            self.dependencies.push(dep);
        }
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_expected_duration(mut self, secs: u64) -> Self {
        self.expected_duration_secs = Some(secs);
        self
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot::new(self.status, self.owner)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_owned_by(&self, worker: &WorkerId) -> bool {
        self.status.is_active() && self.owner.as_ref() == Some(worker)
    }

    /// Apply a patch in place. Used by stores after the CAS check passed.
    pub fn apply(&mut self, patch: TaskPatch) {
        if let Some(at) = patch.last_progress {
            self.last_progress = Some(at);
        }
        if let Some(output) = patch.output {
            self.output = output;
        }
        if let Some(justification) = patch.justification {
            self.justification = Some(justification);
        }
        if let Some(escalation) = patch.escalation {
            self.escalation = escalation;
        }
        if let Some(boundary) = patch.scope_boundary {
            self.scope.boundary = Some(boundary);
        }
    }
}
