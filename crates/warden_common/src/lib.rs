//! Warden Common - shared types for the reconciliation engine
//!
//! Manifest model, configuration, error taxonomy, the host-wide execution
//! lock and the operations journal. Nothing in here talks to the hypervisor.

pub mod config;
pub mod error;
pub mod lock;
pub mod manifest;
pub mod ops_log;
pub mod query;
pub mod types;

pub use config::{DefaultsConfig, VmConfig, WardenConfig, CONFIG_PATH};
pub use error::{Result, WardenError};
pub use lock::{ExecutionLock, LockInfo};
pub use manifest::{
    CloudInit, Declaration, EntryDefaults, Manifest, ManifestEntry, RejectedEntry, StorageSpec,
    Template,
};
pub use ops_log::{OpsEntry, OpsJournal, OpsOutcome};
pub use types::*;
