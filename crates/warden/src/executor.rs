//! Command Executor - runs platform commands under a per-call timeout
//!
//! Queries always run. Mutations are skipped and logged in dry-run mode, and
//! journaled in live mode. A timeout or non-zero exit becomes an error value
//! for the caller to log; it never aborts the run.

use async_trait::async_trait;
use std::fmt;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};
use warden_common::{OpsJournal, OpsOutcome, Result, WardenError};

/// A program plus its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append `--key value` pairs
    pub fn options(mut self, options: &[(String, String)]) -> Self {
        for (key, value) in options {
            self.args.push(format!("--{}", key));
            self.args.push(value.clone());
        }
        self
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Raw result of a finished command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Runs an invocation to completion.
///
/// Returns `Ok` for any exit status; `Err` only for spawn failures
/// (`CommandSpawn`) and timeouts (`CommandTimeout`).
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, invocation: &Invocation, timeout: Duration) -> Result<CommandOutput>;
}

/// Runner that executes real processes
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, invocation: &Invocation, timeout: Duration) -> Result<CommandOutput> {
        let child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WardenError::CommandSpawn {
                command: invocation.to_string(),
                reason: e.to_string(),
            })?;

        // Dropping the future on timeout drops the child, which kills it
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(CommandOutput {
                code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            }),
            Ok(Err(e)) => Err(WardenError::CommandSpawn {
                command: invocation.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(WardenError::CommandTimeout {
                command: invocation.to_string(),
                secs: timeout.as_secs(),
            }),
        }
    }
}

/// How long a mutation may take
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallBudget {
    Short,
    Long,
}

/// Counters for the run report
#[derive(Debug, Default)]
struct Counters {
    executed: AtomicUsize,
    simulated: AtomicUsize,
    failed: AtomicUsize,
}

/// Snapshot of mutation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MutationStats {
    pub executed: usize,
    pub simulated: usize,
    pub failed: usize,
}

/// Executes platform commands with mode and timeout policy
pub struct Executor {
    runner: Arc<dyn CommandRunner>,
    dry_run: bool,
    timeout: Duration,
    long_timeout: Duration,
    journal: OpsJournal,
    counters: Counters,
}

impl Executor {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        dry_run: bool,
        timeout: Duration,
        long_timeout: Duration,
        journal: OpsJournal,
    ) -> Self {
        Self {
            runner,
            dry_run,
            timeout,
            long_timeout,
            journal,
            counters: Counters::default(),
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Run a read-only command and return its stdout
    pub async fn query(&self, invocation: &Invocation) -> Result<String> {
        debug!("Query: {}", invocation);
        let output = self.runner.run(invocation, self.timeout).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(WardenError::command_failure(
                invocation.to_string(),
                output.code,
                output.stderr.trim(),
            ))
        }
    }

    /// Run a state-changing command, or log it in dry-run mode
    pub async fn mutate(&self, invocation: &Invocation, budget: CallBudget) -> Result<()> {
        if self.dry_run {
            info!("[DRY-RUN] Would execute: {}", invocation);
            self.counters.simulated.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let timeout = match budget {
            CallBudget::Short => self.timeout,
            CallBudget::Long => self.long_timeout,
        };

        info!("Executing: {}", invocation);
        self.counters.executed.fetch_add(1, Ordering::Relaxed);
        let command = invocation.to_string();

        match self.runner.run(invocation, timeout).await {
            Ok(output) if output.success() => {
                self.journal.record(OpsOutcome::Ok, &command);
                Ok(())
            }
            Ok(output) => {
                self.journal.record(OpsOutcome::Failed, &command);
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                let detail = if output.stderr.trim().is_empty() {
                    output.stdout.trim().to_string()
                } else {
                    output.stderr.trim().to_string()
                };
                Err(WardenError::command_failure(command, output.code, detail))
            }
            Err(e) => {
                let outcome = match e {
                    WardenError::CommandTimeout { .. } => OpsOutcome::TimedOut,
                    _ => OpsOutcome::Failed,
                };
                self.journal.record(outcome, &command);
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> MutationStats {
        MutationStats {
            executed: self.counters.executed.load(Ordering::Relaxed),
            simulated: self.counters.simulated.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn executor(dry_run: bool, journal: OpsJournal) -> Executor {
        Executor::new(
            Arc::new(SystemRunner),
            dry_run,
            Duration::from_secs(5),
            Duration::from_secs(5),
            journal,
        )
    }

    #[test]
    fn test_invocation_display() {
        let inv = Invocation::new("qm", ["set", "100"])
            .options(&[("ipconfig0".to_string(), "ip=dhcp".to_string())])
            .arg("has space");
        assert_eq!(inv.to_string(), "qm set 100 --ipconfig0 ip=dhcp 'has space'");
    }

    #[tokio::test]
    async fn test_query_echo() {
        let exec = executor(false, OpsJournal::disabled("t"));
        let out = exec.query(&Invocation::new("echo", ["hello"])).await.unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn test_query_failure_is_command_failure() {
        let exec = executor(false, OpsJournal::disabled("t"));
        let err = exec.query(&Invocation::new("false", Vec::<String>::new())).await.unwrap_err();
        assert!(matches!(err, WardenError::CommandFailure { code: 1, .. }));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let exec = executor(false, OpsJournal::disabled("t"));
        let err = exec
            .query(&Invocation::new("/nonexistent/warden-test-binary", ["x"]))
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::CommandSpawn { .. }));
    }

    #[tokio::test]
    async fn test_timeout_kills_and_reports() {
        let exec = Executor::new(
            Arc::new(SystemRunner),
            false,
            Duration::from_millis(200),
            Duration::from_millis(200),
            OpsJournal::disabled("t"),
        );
        let err = exec
            .mutate(&Invocation::new("sleep", ["5"]), CallBudget::Short)
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::CommandTimeout { .. }));
        assert_eq!(exec.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_dry_run_skips_mutation() {
        let temp = TempDir::new().unwrap();
        let marker = temp.path().join("touched");
        let journal_path = temp.path().join("ops.log");
        let exec = executor(true, OpsJournal::open(Some(journal_path.clone()), "t"));

        exec.mutate(
            &Invocation::new("touch", [marker.display().to_string()]),
            CallBudget::Short,
        )
        .await
        .unwrap();

        assert!(!marker.exists());
        assert!(!journal_path.exists());
        assert_eq!(exec.stats().simulated, 1);
        assert_eq!(exec.stats().executed, 0);
    }

    #[tokio::test]
    async fn test_live_mutation_is_journaled() {
        let temp = TempDir::new().unwrap();
        let marker = temp.path().join("touched");
        let journal_path = temp.path().join("ops.log");
        let exec = executor(false, OpsJournal::open(Some(journal_path.clone()), "run-9"));

        exec.mutate(
            &Invocation::new("touch", [marker.display().to_string()]),
            CallBudget::Short,
        )
        .await
        .unwrap();

        assert!(marker.exists());
        let entries = OpsJournal::read_all(&journal_path);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].run_id, "run-9");
        assert_eq!(entries[0].outcome, OpsOutcome::Ok);
    }
}
