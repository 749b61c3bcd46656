//! Integration test suite for concord.
//!
//! These tests drive the coordination core through the `Run` facade and
//! the public component APIs, the way an embedding service would.
//!
//! # Test Categories
//!
//! - `claim_races`: first-write-wins claiming and double-claim logging
//! - `dependencies`: cycle rejection and dependency-ordered eligibility
//! - `escalation_flow`: stall, off-scope and capability-loss remediation
//! - `conflicts`: in-flight conflict holds, arbitration and synthesis
//! - `budget`: ceiling, checkpoint and reconfiguration
//! - `worker_loops`: concurrent worker loops over a shared store
//! - `file_store`: persistence across reopen


mod budget;
mod claim_races;
mod conflicts;
mod dependencies;
mod escalation_flow;
mod file_store;
mod worker_loops;
