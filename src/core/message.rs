//! Advisory messages between workers and the coordination layer.
//!
//! Messages are logged append-only and never change task state.

use crate::core::task::{Payload, TaskId};
use crate::core::worker::WorkerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who sent a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "id")]
pub enum Sender {
    /// The coordination layer itself (escalation notices, scope re-issues).
    Coordinator,
    Worker(WorkerId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "id")]
pub enum Recipient {
    Worker(WorkerId),
    Broadcast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Note,
    /// Sent to the owner of a stalled task.
    Clarification,
    /// Sent when a task is re-issued with an explicit scope boundary.
    ScopeReissue,
    /// Sent when a task is held for, or released from, arbitration.
    Arbitration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Position in the message log, assigned by the store.
    #[serde(default)]
    pub seq: u64,
    pub sender: Sender,
    pub recipient: Recipient,
    #[serde(default)]
    pub kind: MessageKind,
    /// Task the message is about, if any.
    #[serde(default)]
    pub task: Option<TaskId>,
    pub payload: Payload,
    pub sent_at: DateTime<Utc>,
}

impl Message {
    pub fn new(sender: Sender, recipient: Recipient, payload: Payload) -> Self {
        Self {
            seq: 0,
            sender,
            recipient,
            kind: MessageKind::Note,
            task: None,
            payload,
            sent_at: Utc::now(),
        }
    }

    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn about(mut self, task: TaskId) -> Self {
        self.task = Some(task);
        self
    }

    /// Whether `worker` should see this message in its inbox.
    pub fn is_for(&self, worker: &WorkerId) -> bool {
        match self.recipient {
            Recipient::Worker(id) => id == *worker,
            Recipient::Broadcast => self.sender != Sender::Worker(*worker),
        }
    }
}
