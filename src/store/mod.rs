//! The task store: the single shared record of every task and worker.
//!
//! All coordination is expressed as reads and writes against a
//! [`TaskStore`]. Tasks change only through
//! [`TaskStore::compare_and_set`], which is the concurrency control point
//! for the whole system. Messages, ledger entries and conflict records are
//! append-only logs.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::core::{
    ConflictRecord, LedgerEntry, Message, Task, TaskId, TaskPatch, TaskSnapshot, Worker, WorkerId,
};
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Store handle shared by every coordination component.
pub type SharedStore = Arc<dyn TaskStore>;

/// Store contract shared by every backend.
///
/// Implementations must make `compare_and_set` atomic with respect to every
/// other call: the status/owner check and the write happen under one lock.
pub trait TaskStore: Send + Sync {
    /// Store a new pending task.
    ///
    /// Fails with `Error::Duplicate` if the id exists and `Error::Cycle` if
    /// its dependencies loop back to it. A rejected task is not stored.
    fn create(&self, task: Task) -> Result<Task>;

    /// Current snapshot of a task, or `Error::NotFound`.
    fn read(&self, id: &TaskId) -> Result<Task>;

    /// Atomically move a task from `expected` to `next`, applying `patch`.
    ///
    /// Fails with `Error::StaleWrite` carrying the actual state when the
    /// stored status/owner differ from `expected`.
    fn compare_and_set(
        &self,
        id: &TaskId,
        expected: TaskSnapshot,
        next: TaskSnapshot,
        patch: TaskPatch,
    ) -> Result<Task>;

    /// Every task in creation order.
    fn list_tasks(&self) -> Result<Vec<Task>>;

    /// Failed writes that tried to take ownership of `id` from another worker.
    fn cas_conflicts(&self, id: &TaskId) -> Result<Vec<CasConflict>>;

    /// Insert a new worker record.
    fn put_worker(&self, worker: Worker) -> Result<()>;

    fn read_worker(&self, id: &WorkerId) -> Result<Worker>;

    /// Atomically modify a worker record.
    fn update_worker(&self, id: &WorkerId, f: &mut dyn FnMut(&mut Worker)) -> Result<Worker>;

    /// Every worker in registration order.
    fn list_workers(&self) -> Result<Vec<Worker>>;

    /// Append to the message log, returning the message with its sequence number.
    fn append_message(&self, message: Message) -> Result<Message>;

    fn messages(&self) -> Result<Vec<Message>>;

    fn append_ledger(&self, entry: LedgerEntry) -> Result<LedgerEntry>;

    fn ledger(&self) -> Result<Vec<LedgerEntry>>;

    fn append_conflict(&self, record: ConflictRecord) -> Result<ConflictRecord>;

    fn conflicts(&self) -> Result<Vec<ConflictRecord>>;

    fn run_state(&self) -> Result<RunState>;

    fn put_run_state(&self, state: RunState) -> Result<()>;
}

/// Whether claims may run in parallel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Parallel,
    /// One task in flight at a time, entered when execution capability is lost.
    SequentialFallback,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Parallel => write!(f, "parallel"),
            RunMode::SequentialFallback => write!(f, "sequential-fallback"),
        }
    }
}

/// Run-wide settings shared through the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RunState {
    #[serde(default)]
    pub mode: RunMode,
    #[serde(default)]
    pub fallback_reason: Option<String>,
    /// Budget ceiling in cost units. `None` means no budget was configured.
    #[serde(default)]
    pub budget_ceiling: Option<u64>,
    /// Spend level at which a human cleared the near-limit checkpoint.
    #[serde(default)]
    pub checkpoint_cleared_at: Option<u64>,
}

/// A compare-and-set that lost to an existing owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CasConflict {
    pub seq: u64,
    pub task: TaskId,
    pub expected: TaskSnapshot,
    pub attempted: TaskSnapshot,
    pub actual: TaskSnapshot,
    pub at: DateTime<Utc>,
}

/// Whether a failed write counts as contention for ownership.
pub(crate) fn is_ownership_contention(attempted: &TaskSnapshot, actual: &TaskSnapshot) -> bool {
    match (attempted.owner, actual.owner) {
        (Some(want), Some(held)) => want != held && actual.status.is_active(),
        _ => false,
    }
}

/// Serializable image of a whole store.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreSnapshot {
    pub version: u32,
    pub next_seq: u64,
    pub tasks: Vec<Task>,
    pub workers: Vec<Worker>,
    pub messages: Vec<Message>,
    pub ledger: Vec<LedgerEntry>,
    pub conflicts: Vec<ConflictRecord>,
    pub cas_conflicts: Vec<CasConflict>,
    pub run_state: RunState,
}

pub(crate) const SNAPSHOT_VERSION: u32 = 1;
