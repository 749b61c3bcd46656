//! Core domain models for concord.
//!
//! Tasks, workers, messages, conflict records and ledger entries, plus the
//! dependency graph used to reject cycles at creation time.

pub mod conflict;
pub mod dag;
pub mod ledger;
pub mod message;
pub mod task;
pub mod worker;

pub use conflict::{ConflictRecord, ConflictStatus, ConflictingClaim};
pub use dag::DependencyGraph;
pub use ledger::LedgerEntry;
pub use message::{Message, MessageKind, Recipient, Sender};
pub use task::{
    EscalationState, FailureClass, Finding, Payload, Priority, Scope, Task, TaskId, TaskOutput,
    TaskPatch, TaskSnapshot, TaskStatus,
};
pub use worker::{Worker, WorkerId, WorkerState};
