//! Foreign-Workload Auditor
//!
//! Reports host resources the manifest does not declare, each with a
//! manifest entry reconstructed from its live configuration. Read-only.

use crate::parse::{LiveConfig, Volume};
use crate::platform::{Host, Lifecycle};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use tracing::{info, warn};
use warden_common::{
    AuditFinding, CloudInit, DesiredState, EntryDefaults, ManifestEntry, PowerState, ResourceKind,
    Result, StorageSpec, Template, VmConfig,
};

/// Placeholder template for reconstructed entries
pub const UNKNOWN_TEMPLATE: &str = "<unknown>";

#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditReport {
    pub findings: Vec<AuditFinding>,
    /// Declared ids with no resource on the host after processing
    pub absent_declared: Vec<u32>,
}

/// Observed ids that are not declared
pub fn foreign_ids(observed: &BTreeSet<u32>, declared: &HashSet<u32>) -> Vec<u32> {
    observed
        .iter()
        .copied()
        .filter(|id| !declared.contains(id))
        .collect()
}

/// Rebuild a manifest entry from what the platform reports
pub fn suggest_entry(
    lifecycle: &dyn Lifecycle,
    id: u32,
    live: &LiveConfig,
    power: PowerState,
    defaults: &EntryDefaults,
    layout: &VmConfig,
) -> ManifestEntry {
    let kind = lifecycle.kind();
    let is_vm = kind == ResourceKind::Vm;
    let disk_key = match kind {
        ResourceKind::Container => "rootfs",
        ResourceKind::Vm => layout.disk_key.as_str(),
    };

    let disk = live.get(disk_key).and_then(Volume::parse);
    let storage = disk.as_ref().map(|volume| StorageSpec {
        target: volume.storage.clone(),
        disk_size: volume.size(),
    });

    let cloud_init = is_vm
        .then(|| {
            let wired = live
                .get(&layout.cloudinit_device)
                .and_then(Volume::parse)
                .is_some_and(|v| v.is_cloudinit());
            let user = live.get("ciuser").map(str::to_string);
            (wired || user.is_some()).then(|| CloudInit {
                enabled: true,
                user,
                ssh_keys: None,
                ip_config: live.get("ipconfig0").map(str::to_string),
            })
        })
        .flatten();

    ManifestEntry {
        kind,
        id,
        hostname: live.get(lifecycle.hostname_key()).map(str::to_string),
        template: Some(Template::Image(UNKNOWN_TEMPLATE.to_string())),
        memory: live.get_u64("memory"),
        cores: live.get_u64("cores").and_then(|c| u32::try_from(c).ok()),
        sockets: is_vm.then(|| {
            live.get_u64("sockets")
                .and_then(|s| u32::try_from(s).ok())
                .unwrap_or(defaults.sockets)
        }),
        cpu_model: is_vm.then(|| {
            live.get("cpu")
                .map(str::to_string)
                .unwrap_or_else(|| defaults.cpu_model.clone())
        }),
        network: live.get("net0").map(str::to_string),
        storage,
        swap: (!is_vm).then(|| live.get_u64("swap").unwrap_or(defaults.swap_mb)),
        on_boot: live.flag("onboot").unwrap_or(false),
        protection: live.flag("protection").unwrap_or(false),
        cloud_init,
        state: match power {
            PowerState::Stopped => DesiredState::Stopped,
            _ => DesiredState::Running,
        },
    }
}

/// List both kinds and report every undeclared id.
///
/// Only listing failures are errors. A foreign resource whose status or
/// config cannot be read is still reported, with what could be read.
pub async fn audit(
    host: &Host,
    declared: &HashSet<u32>,
    defaults: &EntryDefaults,
    layout: &VmConfig,
) -> Result<AuditReport> {
    let mut report = AuditReport::default();
    let mut observed_any = BTreeSet::new();

    for kind in ResourceKind::ALL {
        let observed = host.list_ids(kind).await?;
        observed_any.extend(observed.iter().copied());

        for id in foreign_ids(&observed, declared) {
            let power = host.power_state(kind, id).await.unwrap_or_else(|e| {
                warn!("{} {}: status unavailable during audit: {}", kind, id, e);
                PowerState::Unknown
            });
            let live = host.config(kind, id).await.unwrap_or_else(|e| {
                warn!("{} {}: config unavailable during audit: {}", kind, id, e);
                LiveConfig::default()
            });

            let suggested = suggest_entry(host.lifecycle(kind), id, &live, power, defaults, layout);
            let json = serde_json::to_string(&suggested)
                .unwrap_or_else(|e| format!("<unserializable: {}>", e));
            warn!(
                "FOREIGN {} {} ({}) is not declared in the manifest; suggested entry: {}",
                kind, id, power, json
            );

            report.findings.push(AuditFinding {
                id,
                kind,
                observed: live.into_values(),
                power_state: power,
                suggested,
            });
        }
    }

    let mut absent: Vec<u32> = declared
        .iter()
        .copied()
        .filter(|id| !observed_any.contains(id))
        .collect();
    absent.sort_unstable();
    if !absent.is_empty() {
        let list: Vec<String> = absent.iter().map(ToString::to_string).collect();
        warn!(
            "Declared ids absent from host after processing (not audited): {}",
            list.join(", ")
        );
    }
    report.absent_declared = absent;

    info!("Audit complete: {} foreign resource(s)", report.findings.len());
    Ok(report)
}
