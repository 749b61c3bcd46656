//! Run events.
//!
//! Components report what they did over a bounded `mpsc` channel. Sending
//! uses `try_send`, so a slow or absent listener never stalls coordination;
//! events that do not fit are dropped.

use crate::clog_trace;
use crate::core::{ConflictStatus, FailureClass, TaskId, WorkerId};
use crate::orchestration::governor::BudgetStatus;
use crate::store::RunMode;
use serde::Serialize;
use tokio::sync::mpsc;

/// Default capacity of the event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum RunEvent {
    TaskCreated {
        task: TaskId,
    },
    TaskClaimed {
        task: TaskId,
        worker: WorkerId,
    },
    /// A claim lost to an existing owner.
    ClaimLost {
        task: TaskId,
        worker: WorkerId,
        owner: WorkerId,
    },
    TaskStarted {
        task: TaskId,
        worker: WorkerId,
    },
    TaskReleased {
        task: TaskId,
        worker: WorkerId,
        reason: String,
    },
    TaskCompleted {
        task: TaskId,
        worker: WorkerId,
    },
    TaskAbandoned {
        task: TaskId,
        justification: String,
    },
    Escalated {
        task: TaskId,
        class: FailureClass,
        action: String,
    },
    ConflictRecorded {
        conflict: String,
        subject: String,
    },
    ConflictResolved {
        conflict: String,
        status: ConflictStatus,
    },
    BudgetThreshold {
        status: BudgetStatus,
        spent: u64,
        ceiling: u64,
    },
    ModeChanged {
        mode: RunMode,
        reason: String,
    },
    WorkerRegistered {
        worker: WorkerId,
        role: String,
    },
    WorkerRetired {
        worker: WorkerId,
        reason: String,
    },
}

/// Sending half handed to every component. Cloning is cheap.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<RunEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<RunEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink that discards everything.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.tx {
            if let Err(e) = tx.try_send(event) {
                clog_trace!("event dropped: {}", e);
            }
        }
    }
}

/// Create a connected sink and receiver.
pub fn channel(capacity: usize) -> (EventSink, mpsc::Receiver<RunEvent>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSink::new(tx), rx)
}
