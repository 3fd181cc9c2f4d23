//! Run Coordinator
//!
//! One pass: take the lock, parse the manifest, reconcile each entry in
//! declaration order, audit the host, report. Entry failures are recorded
//! and the pass moves on; only lock and manifest errors end it early.

use crate::audit::{self, AuditReport};
use crate::classifier::{self, Disposition};
use crate::cold_apply::cold_apply;
use crate::drift;
use crate::executor::{CommandRunner, Executor};
use crate::platform::Host;
use crate::power::reconcile_power;
use crate::provision::{provision, ProvisionOutcome};
use crate::report::{ActionRecord, EntryReport, RunReport};
use chrono::Utc;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};
use uuid::Uuid;
use warden_common::{
    Declaration, ExecutionLock, Manifest, ManifestEntry, OpsJournal, Result, WardenConfig,
    WardenError,
};

/// Per-invocation overrides
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub dry_run: bool,
    pub manifest_path: Option<PathBuf>,
    pub lock_wait: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Starting,
    Locked,
    Parsing,
    Dispatching(usize),
    Auditing,
    Done,
    LockFailed,
    ManifestInvalid,
}

/// State threaded through one pass
#[derive(Debug)]
pub struct RunContext {
    pub run_id: String,
    pub dry_run: bool,
    pub state: RunState,
    /// Every id the manifest declares, including rejected entries
    pub declared: HashSet<u32>,
    pub entries: Vec<EntryReport>,
    pub audit: AuditReport,
}

impl RunContext {
    fn new(dry_run: bool) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            dry_run,
            state: RunState::Starting,
            declared: HashSet::new(),
            entries: Vec::new(),
            audit: AuditReport::default(),
        }
    }

    fn transition(&mut self, next: RunState) {
        debug!("run {}: {:?} -> {:?}", self.run_id, self.state, next);
        self.state = next;
    }

    fn mode(&self) -> &'static str {
        if self.dry_run {
            "dry-run"
        } else {
            "live"
        }
    }
}

pub struct Coordinator {
    config: WardenConfig,
    runner: Arc<dyn CommandRunner>,
    options: RunOptions,
}

impl Coordinator {
    pub fn new(config: WardenConfig, runner: Arc<dyn CommandRunner>, options: RunOptions) -> Self {
        Self {
            config,
            runner,
            options,
        }
    }

    fn manifest_path(&self) -> PathBuf {
        self.options
            .manifest_path
            .clone()
            .unwrap_or_else(|| self.config.manifest_path.clone())
    }

    pub async fn run(&self) -> Result<RunReport> {
        let mut ctx = RunContext::new(self.options.dry_run);
        let started_at = Utc::now();
        let manifest_path = self.manifest_path();
        info!("Starting run {} in {} mode", ctx.run_id, ctx.mode());

        let wait = self.options.lock_wait.unwrap_or_else(|| self.config.lock_wait());
        let _lock = match ExecutionLock::acquire(
            &self.config.lock_path,
            wait,
            self.config.lock_stale_after(),
            &ctx.run_id,
        )
        .await
        {
            Ok(lock) => lock,
            Err(e) => {
                ctx.transition(RunState::LockFailed);
                return Err(e);
            }
        };
        ctx.transition(RunState::Locked);

        ctx.transition(RunState::Parsing);
        let manifest = match Manifest::load(&manifest_path, &self.config.entry_defaults()) {
            Ok(manifest) => manifest,
            Err(e) => {
                ctx.transition(RunState::ManifestInvalid);
                return Err(e);
            }
        };
        info!(
            "Loaded {} entries from {} ({} rejected)",
            manifest.len(),
            manifest_path.display(),
            manifest.rejected.len()
        );
        ctx.declared = manifest.declared_ids();

        let journal = OpsJournal::open(self.config.ops_log_path.clone(), &ctx.run_id);
        let executor = Executor::new(
            self.runner.clone(),
            ctx.dry_run,
            self.config.command_timeout(),
            self.config.long_command_timeout(),
            journal,
        );
        let host = Host::new(executor, &self.config);

        for (index, declaration) in manifest.declarations().into_iter().enumerate() {
            ctx.transition(RunState::Dispatching(index));
            let report = match declaration {
                Declaration::Entry(entry) => self.reconcile_entry(&host, entry).await,
                Declaration::Rejected(rejected) => {
                    match rejected.id {
                        Some(id) => error!("manifest entry {} (id {}) skipped: {}", rejected.index, id, rejected.reason),
                        None => error!("manifest entry {} skipped: {}", rejected.index, rejected.reason),
                    }
                    EntryReport::rejected(rejected.id, &rejected.reason)
                }
            };
            ctx.entries.push(report);
        }

        ctx.transition(RunState::Auditing);
        ctx.audit = match audit::audit(
            &host,
            &ctx.declared,
            &self.config.entry_defaults(),
            &self.config.vm,
        )
        .await
        {
            Ok(report) => report,
            Err(e) => {
                error!("Foreign-workload audit failed: {}", e);
                AuditReport::default()
            }
        };

        ctx.transition(RunState::Done);
        let report = RunReport {
            mode: ctx.mode(),
            run_id: ctx.run_id,
            started_at,
            finished_at: Utc::now(),
            manifest: manifest_path.display().to_string(),
            entries: ctx.entries,
            findings: ctx.audit.findings,
            absent_declared: ctx.audit.absent_declared,
            mutations: host.stats(),
        };
        info!("{}", report.summary());
        Ok(report)
    }

    async fn reconcile_entry(&self, host: &Host, entry: &ManifestEntry) -> EntryReport {
        let (kind, id) = (entry.kind, entry.id);
        let mut report = EntryReport::new(id, kind);
        debug!("Reconciling {} {}", kind, id);

        let classification = match classifier::classify(host, id).await {
            Ok(c) => c,
            Err(e) => {
                error!("{} {}: cannot list host resources, skipping: {}", kind, id, e);
                return report.failed(e);
            }
        };
        let disposition = match classifier::resolve(id, kind, classification) {
            Ok(d) => d,
            Err(e) => {
                error!("{}; skipping entry", e);
                return report.skipped(e);
            }
        };

        if disposition == Disposition::Missing {
            match provision(host, entry, &self.config.vm).await {
                Ok(ProvisionOutcome::Created) => {
                    info!("{} {} created", kind, id);
                    report.provision = Some(ProvisionOutcome::Created);
                }
                Ok(ProvisionOutcome::Simulated) => {
                    info!(
                        "[DRY-RUN] Would run drift detection and power reconcile ({}) on new {} {}",
                        entry.state, kind, id
                    );
                    report.provision = Some(ProvisionOutcome::Simulated);
                    return report.finish(true);
                }
                Err(e @ WardenError::Provision { .. }) => {
                    error!("{} {}: {}; skipping entry", kind, id, e);
                    return report.skipped(e);
                }
                Err(e) => {
                    error!("{} {}: creation failed: {}", kind, id, e);
                    return report.failed(e);
                }
            }
        }

        let live = match host.config(kind, id).await {
            Ok(live) => live,
            Err(e) => {
                error!("{} {}: cannot read configuration: {}", kind, id, e);
                return report.failed(e);
            }
        };

        let actions = drift::detect(entry, &live, &self.config.vm);
        if actions.is_empty() {
            debug!("{} {}: no drift", kind, id);
        }
        for action in actions {
            let outcome = cold_apply(host, &action).await;
            report.actions.push(ActionRecord { action, outcome });
        }

        report.power = Some(reconcile_power(host, kind, id, entry.state).await);
        report.finish(host.is_dry_run())
    }
}
