//! Worker records.
//!
//! A worker is an independent execution agent. Its record lives in the
//! store next to the tasks so that claims, heartbeats and retirement are
//! visible to every other participant.

use crate::core::task::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for WorkerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    #[default]
    Active,
    Stuck,
    Removed,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Active => write!(f, "active"),
            WorkerState::Stuck => write!(f, "stuck"),
            WorkerState::Removed => write!(f, "removed"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    /// Role label assigned by whoever launched the worker.
    pub role: String,
    /// Task currently claimed, at most one.
    #[serde(default)]
    pub current_task: Option<TaskId>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    /// Cumulative cost units consumed.
    #[serde(default)]
    pub cost_consumed: u64,
    #[serde(default)]
    pub state: WorkerState,
    /// Failures attributed to this worker by escalation.
    #[serde(default)]
    pub failures: u32,
    #[serde(default)]
    pub removal_reason: Option<String>,
}

impl Worker {
    pub fn new(role: &str) -> Self {
        let now = Utc::now();
        Self {
            id: WorkerId::new(),
            role: role.to_string(),
            current_task: None,
            registered_at: now,
            last_heartbeat: now,
            cost_consumed: 0,
            state: WorkerState::Active,
            failures: 0,
            removal_reason: None,
        }
    }

    pub fn is_removed(&self) -> bool {
        self.state == WorkerState::Removed
    }

    pub fn is_idle(&self) -> bool {
        self.current_task.is_none()
    }
}
