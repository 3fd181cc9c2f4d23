//! Run report - what one pass did, per entry

use crate::cold_apply::ColdApplyOutcome;
use crate::executor::MutationStats;
use crate::power::PowerOutcome;
use crate::provision::ProvisionOutcome;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::Path;
use warden_common::{AuditFinding, ReconciliationAction, ResourceKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryOutcome {
    /// Observed state already matched
    InSync,
    /// Drift or power corrected
    Reconciled,
    Created,
    /// Dry-run: corrections were logged, not made
    Simulated,
    /// At least one action or power transition failed
    Degraded,
    /// Rejected, type conflict, or missing creation fields
    Skipped,
    /// Listing, config query or creation failed
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionRecord {
    pub action: ReconciliationAction,
    pub outcome: ColdApplyOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntryReport {
    pub id: Option<u32>,
    pub kind: Option<ResourceKind>,
    pub outcome: EntryOutcome,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ActionRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provision: Option<ProvisionOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power: Option<PowerOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EntryReport {
    pub fn new(id: u32, kind: ResourceKind) -> Self {
        Self {
            id: Some(id),
            kind: Some(kind),
            outcome: EntryOutcome::InSync,
            actions: Vec::new(),
            provision: None,
            power: None,
            error: None,
        }
    }

    pub fn rejected(id: Option<u32>, reason: &str) -> Self {
        Self {
            id,
            kind: None,
            outcome: EntryOutcome::Skipped,
            actions: Vec::new(),
            provision: None,
            power: None,
            error: Some(reason.to_string()),
        }
    }

    pub fn skipped(mut self, reason: impl ToString) -> Self {
        self.outcome = EntryOutcome::Skipped;
        self.error = Some(reason.to_string());
        self
    }

    pub fn failed(mut self, reason: impl ToString) -> Self {
        self.outcome = EntryOutcome::Failed;
        self.error = Some(reason.to_string());
        self
    }

    /// Derive the outcome from what was recorded
    pub fn finish(mut self, dry_run: bool) -> Self {
        let action_failed = self.actions.iter().any(|a| !a.outcome.is_applied());
        let power_failed = matches!(self.power, Some(PowerOutcome::Failed(_)));
        let changed = !self.actions.is_empty() || matches!(self.power, Some(PowerOutcome::Changed(_)));

        self.outcome = if action_failed || power_failed {
            EntryOutcome::Degraded
        } else {
            match self.provision {
                Some(ProvisionOutcome::Created) => EntryOutcome::Created,
                Some(ProvisionOutcome::Simulated) => EntryOutcome::Simulated,
                None if changed && dry_run => EntryOutcome::Simulated,
                None if changed => EntryOutcome::Reconciled,
                None => EntryOutcome::InSync,
            }
        };
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub mode: &'static str,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub manifest: String,
    pub entries: Vec<EntryReport>,
    pub findings: Vec<AuditFinding>,
    pub absent_declared: Vec<u32>,
    pub mutations: MutationStats,
}

impl RunReport {
    pub fn count(&self, outcome: EntryOutcome) -> usize {
        self.entries.iter().filter(|e| e.outcome == outcome).count()
    }

    pub fn action_count(&self) -> usize {
        self.entries.iter().map(|e| e.actions.len()).sum()
    }

    pub fn summary(&self) -> String {
        format!(
            "Run {} ({}) finished: {} entries, {} in sync, {} reconciled, {} created, {} simulated, \
             {} degraded, {} skipped, {} failed; {} action(s); {} foreign; commands executed {}, simulated {}, failed {}",
            self.run_id,
            self.mode,
            self.entries.len(),
            self.count(EntryOutcome::InSync),
            self.count(EntryOutcome::Reconciled),
            self.count(EntryOutcome::Created),
            self.count(EntryOutcome::Simulated),
            self.count(EntryOutcome::Degraded),
            self.count(EntryOutcome::Skipped),
            self.count(EntryOutcome::Failed),
            self.action_count(),
            self.findings.len(),
            self.mutations.executed,
            self.mutations.simulated,
            self.mutations.failed,
        )
    }

    pub fn write_to(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
    }
}
