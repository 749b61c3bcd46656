pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod run;
pub mod store;

pub use config::Config;
pub use core::{
    ConflictRecord, ConflictStatus, Finding, Payload, Priority, Scope, Task, TaskId, TaskOutput,
    TaskStatus, Worker, WorkerId,
};
pub use error::{Error, Result};
pub use orchestration::{
    ClaimCoordinator, ClaimGrant, CostGovernor, DependencyResolver, EscalationEngine, ExecError,
    Execution, ProgressMonitor, SynthesisAggregator, TaskExecutor, WorkerLoop, WorkerPool,
};
pub use run::{Run, RunReport, StatusReport, TickReport};
pub use store::{FileStore, MemoryStore, SharedStore, TaskStore};
