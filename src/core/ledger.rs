//! Cost ledger entries.

use crate::core::task::TaskId;
use crate::core::worker::WorkerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    #[serde(default)]
    pub seq: u64,
    pub worker: WorkerId,
    pub task: TaskId,
    pub units: u64,
    pub recorded_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(worker: WorkerId, task: TaskId, units: u64) -> Self {
        Self {
            seq: 0,
            worker,
            task,
            units,
            recorded_at: Utc::now(),
        }
    }
}
