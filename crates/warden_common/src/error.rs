//! Error types for Warden.
//!
//! Lock, manifest and config errors are fatal to a run. Everything else is
//! caught at entry or action granularity and turned into a log record.

use crate::types::ResourceKind;
use thiserror::Error;

/// Exit code for a completed run (with or without corrective actions)
pub const EXIT_SUCCESS: i32 = 0;

/// Exit code for unexpected fatal errors
pub const EXIT_GENERAL_ERROR: i32 = 1;

/// Exit code when the manifest cannot be parsed (EX_DATAERR)
pub const EXIT_MANIFEST_INVALID: i32 = 65;

/// Exit code when the manifest file is absent (EX_NOINPUT)
pub const EXIT_MANIFEST_MISSING: i32 = 66;

/// Exit code when another run holds the lock (EX_TEMPFAIL)
pub const EXIT_LOCK_CONTENTION: i32 = 75;

/// Exit code for an unusable configuration file (EX_CONFIG)
pub const EXIT_CONFIG_INVALID: i32 = 78;

pub type Result<T> = std::result::Result<T, WardenError>;

#[derive(Error, Debug)]
pub enum WardenError {
    #[error("execution lock {path} is held by PID {holder_pid} (waited {waited_secs}s)")]
    LockContention {
        path: String,
        holder_pid: u32,
        waited_secs: u64,
    },

    #[error("manifest not found: {0}")]
    ManifestMissing(String),

    #[error("manifest invalid: {0}")]
    ManifestInvalid(String),

    #[error("type conflict for id {id}: declared {declared}, observed {observed}")]
    TypeConflict {
        id: u32,
        declared: ResourceKind,
        observed: String,
    },

    #[error("command timed out after {secs}s: {command}")]
    CommandTimeout { command: String, secs: u64 },

    #[error("command failed (exit {code}): {command}: {stderr}")]
    CommandFailure {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("failed to spawn {command}: {reason}")]
    CommandSpawn { command: String, reason: String },

    #[error("cannot create id {id}: {reason}")]
    Provision { id: u32, reason: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("lock file error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WardenError {
    /// Process exit code for an error that ends the run
    pub fn exit_code(&self) -> i32 {
        match self {
            WardenError::LockContention { .. } => EXIT_LOCK_CONTENTION,
            WardenError::ManifestMissing(_) => EXIT_MANIFEST_MISSING,
            WardenError::ManifestInvalid(_) => EXIT_MANIFEST_INVALID,
            WardenError::Config(_) => EXIT_CONFIG_INVALID,
            _ => EXIT_GENERAL_ERROR,
        }
    }

    pub fn command_failure(command: impl Into<String>, code: i32, stderr: impl Into<String>) -> Self {
        WardenError::CommandFailure {
            command: command.into(),
            code,
            stderr: stderr.into(),
        }
    }
}
