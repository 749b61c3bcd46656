//! Orchestration layer for concord.
//!
//! Each component owns one concern and talks to the others only through the
//! shared task store: the coordinator changes task state, the monitor reads
//! it, escalation remediates, the governor meters cost, and synthesis merges
//! the results once the run is done.

pub mod coordinator;
pub mod escalation;
pub mod events;
pub mod governor;
pub mod health;
pub mod messaging;
pub mod pool;
pub mod resolver;
pub mod runner;
pub mod synthesis;

pub use coordinator::{ClaimCoordinator, ClaimGrant};
pub use escalation::{EscalationAction, EscalationEngine};
pub use events::{EventSink, RunEvent, DEFAULT_EVENT_CAPACITY};
pub use governor::{BudgetReport, BudgetStatus, CostGovernor};
pub use health::{Classification, DetectedConflict, ProgressMonitor, ScanResult};
pub use messaging::MessageChannel;
pub use pool::{WorkerPool, MAX_WORKER_FAILURES};
pub use resolver::DependencyResolver;
pub use runner::{ExecError, Execution, LoopExit, LoopSummary, TaskExecutor, WorkerLoop};
pub use synthesis::{
    AbandonedTask, Agreement, Contribution, DissentingOpinion, ResolvedConflict,
    SynthesisAggregator, SynthesisReport,
};
