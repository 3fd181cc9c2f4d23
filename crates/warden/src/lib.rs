//! Warden - desired-state reconciliation for containers and VMs
//!
//! Exposes the engine modules so the binary and the integration tests drive
//! the same code.

pub mod audit;
pub mod classifier;
pub mod cli;
pub mod cold_apply;
pub mod coordinator;
pub mod drift;
pub mod executor;
pub mod fake;
pub mod parse;
pub mod platform;
pub mod power;
pub mod provision;
pub mod report;

pub use coordinator::{Coordinator, RunContext, RunOptions, RunState};
pub use executor::{CommandRunner, Invocation, SystemRunner};
pub use report::{EntryOutcome, RunReport};
