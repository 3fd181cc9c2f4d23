//! Operations journal - audit trail of mutating platform commands
//!
//! One line per command actually executed against the host:
//! `2026-03-01T04:00:12Z <run-id> ok qm set 100 --memory 2048`
//!
//! Dry runs never write to the journal. Write failures are logged and never
//! fail the run.

use chrono::{DateTime, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Outcome recorded for a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpsOutcome {
    Ok,
    Failed,
    TimedOut,
}

impl OpsOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpsOutcome::Ok => "ok",
            OpsOutcome::Failed => "failed",
            OpsOutcome::TimedOut => "timeout",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ok" => Some(OpsOutcome::Ok),
            "failed" => Some(OpsOutcome::Failed),
            "timeout" => Some(OpsOutcome::TimedOut),
            _ => None,
        }
    }
}

/// A single journal entry
#[derive(Debug, Clone)]
pub struct OpsEntry {
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    pub outcome: OpsOutcome,
    pub command: String,
}

impl OpsEntry {
    pub fn new(run_id: &str, outcome: OpsOutcome, command: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            run_id: run_id.to_string(),
            outcome,
            command: command.to_string(),
        }
    }

    /// Format as log line
    pub fn to_log_line(&self) -> String {
        format!(
            "{} {} {} {}",
            self.timestamp.format("%Y-%m-%dT%H:%M:%SZ"),
            self.run_id,
            self.outcome.as_str(),
            self.command
        )
    }

    /// Parse from log line
    pub fn from_log_line(line: &str) -> Option<Self> {
        let parts: Vec<&str> = line.splitn(4, ' ').collect();
        if parts.len() < 4 {
            return None;
        }

        let timestamp = DateTime::parse_from_rfc3339(parts[0])
            .ok()?
            .with_timezone(&Utc);

        Some(Self {
            timestamp,
            run_id: parts[1].to_string(),
            outcome: OpsOutcome::from_str(parts[2])?,
            command: parts[3].to_string(),
        })
    }
}

/// Journal writer bound to one run
#[derive(Debug, Clone)]
pub struct OpsJournal {
    path: Option<PathBuf>,
    run_id: String,
}

impl OpsJournal {
    pub fn open(path: Option<PathBuf>, run_id: &str) -> Self {
        Self {
            path,
            run_id: run_id.to_string(),
        }
    }

    /// Journal that records nothing
    pub fn disabled(run_id: &str) -> Self {
        Self::open(None, run_id)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn record(&self, outcome: OpsOutcome, command: &str) {
        let Some(path) = &self.path else {
            return;
        };
        let entry = OpsEntry::new(&self.run_id, outcome, command);
        if let Err(e) = Self::append(path, &entry) {
            warn!("Failed to write ops journal {}: {}", path.display(), e);
        }
    }

    fn append(path: &Path, entry: &OpsEntry) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir)?;
            }
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", entry.to_log_line())?;
        Ok(())
    }

    /// Read all parseable entries from a journal file
    pub fn read_all(path: &Path) -> Vec<OpsEntry> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(_) => return Vec::new(),
        };

        BufReader::new(file)
            .lines()
            .map_while(|line| line.ok())
            .filter_map(|line| OpsEntry::from_log_line(&line))
            .collect()
    }
}
