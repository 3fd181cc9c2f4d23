//! Drift Detector
//!
//! Each resource kind has a fixed table of rules. A rule names the declared
//! attribute, how to read the live value, how to compare, and how to apply a
//! correction. Rules are evaluated independently, in table order, and every
//! mismatch yields one [`ReconciliationAction`].

use crate::parse::{self, LiveConfig, Volume};
use std::fs;
use tracing::warn;
use warden_common::{
    ApplyOp, ManifestEntry, ReconciliationAction, ResourceKind, VmConfig,
};

/// How a declared value is compared to the live one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    /// Trimmed string equality
    Exact,
    /// Integer equality, falling back to string equality
    Numeric,
    /// Same connection settings, ignoring values the platform generates
    Network,
}

/// One row of a drift table
#[derive(Debug, Clone, Copy)]
pub enum Check {
    /// A single config key against a single declared field
    Field {
        key: &'static str,
        declared: fn(&ManifestEntry) -> Option<String>,
        /// Value the platform uses when the key is absent from the config
        observed_default: Option<&'static str>,
        comparator: Comparator,
    },
    /// Primary disk size, grow only
    DiskGrow,
    /// The cloud-init slot holds a cloud-init drive
    CloudInitDevice,
    /// Cloud-init user and network settings
    CloudInitIdentity,
}

#[derive(Debug, Clone, Copy)]
pub struct Rule {
    pub attribute: &'static str,
    pub check: Check,
    /// Needs stop / apply / start. No attribute is live-patchable here.
    pub cold: bool,
}

fn declared_hostname(e: &ManifestEntry) -> Option<String> {
    e.hostname.clone()
}

fn declared_memory(e: &ManifestEntry) -> Option<String> {
    e.memory.map(|v| v.to_string())
}

fn declared_cores(e: &ManifestEntry) -> Option<String> {
    e.cores.map(|v| v.to_string())
}

fn declared_sockets(e: &ManifestEntry) -> Option<String> {
    e.sockets.map(|v| v.to_string())
}

fn declared_cpu(e: &ManifestEntry) -> Option<String> {
    e.cpu_model.clone()
}

fn declared_swap(e: &ManifestEntry) -> Option<String> {
    e.swap.map(|v| v.to_string())
}

fn declared_network(e: &ManifestEntry) -> Option<String> {
    e.network.clone()
}

fn declared_onboot(e: &ManifestEntry) -> Option<String> {
    Some(u8::from(e.on_boot).to_string())
}

fn declared_protection(e: &ManifestEntry) -> Option<String> {
    Some(u8::from(e.protection).to_string())
}

const fn field(
    attribute: &'static str,
    key: &'static str,
    declared: fn(&ManifestEntry) -> Option<String>,
    observed_default: Option<&'static str>,
    comparator: Comparator,
) -> Rule {
    Rule {
        attribute,
        check: Check::Field {
            key,
            declared,
            observed_default,
            comparator,
        },
        cold: true,
    }
}

pub const CONTAINER_RULES: &[Rule] = &[
    field("hostname", "hostname", declared_hostname, None, Comparator::Exact),
    field("memory", "memory", declared_memory, None, Comparator::Numeric),
    field("cores", "cores", declared_cores, None, Comparator::Numeric),
    field("swap", "swap", declared_swap, Some("512"), Comparator::Numeric),
    field("network", "net0", declared_network, None, Comparator::Network),
    field("onBoot", "onboot", declared_onboot, Some("0"), Comparator::Numeric),
    field("protection", "protection", declared_protection, Some("0"), Comparator::Numeric),
];

pub const VM_RULES: &[Rule] = &[
    field("hostname", "name", declared_hostname, None, Comparator::Exact),
    field("memory", "memory", declared_memory, None, Comparator::Numeric),
    field("cores", "cores", declared_cores, None, Comparator::Numeric),
    field("sockets", "sockets", declared_sockets, Some("1"), Comparator::Numeric),
    field("cpuModel", "cpu", declared_cpu, None, Comparator::Exact),
    field("network", "net0", declared_network, None, Comparator::Network),
    field("onBoot", "onboot", declared_onboot, Some("0"), Comparator::Numeric),
    field("protection", "protection", declared_protection, Some("0"), Comparator::Numeric),
    Rule {
        attribute: "diskSize",
        check: Check::DiskGrow,
        cold: true,
    },
    Rule {
        attribute: "cloudInitDevice",
        check: Check::CloudInitDevice,
        cold: true,
    },
    Rule {
        attribute: "cloudInitIdentity",
        check: Check::CloudInitIdentity,
        cold: true,
    },
];

pub fn rules_for(kind: ResourceKind) -> &'static [Rule] {
    match kind {
        ResourceKind::Container => CONTAINER_RULES,
        ResourceKind::Vm => VM_RULES,
    }
}

pub fn values_match(comparator: Comparator, declared: &str, observed: &str) -> bool {
    let declared = declared.trim();
    let observed = observed.trim();
    match comparator {
        Comparator::Exact => declared == observed,
        Comparator::Numeric => match (declared.parse::<u64>(), observed.parse::<u64>()) {
            (Ok(d), Ok(o)) => d == o,
            _ => declared == observed,
        },
        Comparator::Network => net_matches(declared, observed),
    }
}

fn net_pairs(value: &str) -> Vec<(&str, Option<&str>)> {
    value
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| match p.split_once('=') {
            Some((k, v)) => (k.trim(), Some(v.trim())),
            None => (p, None),
        })
        .collect()
}

/// Live keys the platform fills in on its own
fn is_generated(key: &str, value: Option<&str>) -> bool {
    match key {
        "hwaddr" => true,
        "type" => value == Some("veth"),
        _ => false,
    }
}

/// Connection strings are comma-separated `key=value` lists. A bare declared
/// NIC model (`virtio`) matches a live `virtio=<MAC>`. Any other live key
/// that is not declared is drift, unless the platform generated it.
fn net_matches(declared: &str, observed: &str) -> bool {
    let declared = net_pairs(declared);
    let observed = net_pairs(observed);

    let declared_present = declared.iter().all(|(key, value)| match value {
        Some(value) => observed
            .iter()
            .any(|(k, v)| k == key && v.is_some_and(|v| v.eq_ignore_ascii_case(value))),
        None => observed.iter().any(|(k, _)| k == key),
    });
    let no_extras = observed
        .iter()
        .all(|(key, value)| declared.iter().any(|(k, _)| k == key) || is_generated(key, *value));

    declared_present && no_extras
}

/// Boot order with `device` dropped, when the live order lists it
pub fn boot_without(boot: Option<&str>, device: &str, disk_key: &str) -> Option<String> {
    let order = boot?.trim().strip_prefix("order=")?;
    let devices: Vec<&str> = order
        .split(';')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .collect();
    if !devices.contains(&device) {
        return None;
    }
    let kept: Vec<&str> = devices.into_iter().filter(|d| *d != device).collect();
    if kept.is_empty() {
        return Some(format!("order={}", disk_key));
    }
    Some(format!("order={}", kept.join(";")))
}

/// Detect drift for an existing resource.
pub fn detect(
    entry: &ManifestEntry,
    live: &LiveConfig,
    layout: &VmConfig,
) -> Vec<ReconciliationAction> {
    rules_for(entry.kind)
        .iter()
        .filter_map(|rule| evaluate(rule, entry, live, layout))
        .collect()
}

fn evaluate(
    rule: &Rule,
    entry: &ManifestEntry,
    live: &LiveConfig,
    layout: &VmConfig,
) -> Option<ReconciliationAction> {
    let action = |old_value: Option<String>, new_value: String, op: ApplyOp| ReconciliationAction {
        id: entry.id,
        kind: entry.kind,
        attribute: rule.attribute.to_string(),
        old_value,
        new_value,
        cold: rule.cold,
        op,
    };

    match rule.check {
        Check::Field {
            key,
            declared,
            observed_default,
            comparator,
        } => {
            let want = declared(entry)?;
            let have = live.get(key).or(observed_default);
            if have.is_some_and(|have| values_match(comparator, &want, have)) {
                return None;
            }
            Some(action(
                have.map(str::to_string),
                want.clone(),
                ApplyOp::Set {
                    options: vec![(key.to_string(), want)],
                },
            ))
        }

        Check::DiskGrow => {
            let want = entry.disk_size()?;
            let have = live
                .get(&layout.disk_key)
                .and_then(Volume::parse)
                .and_then(|v| v.size())?;
            if want <= have {
                return None;
            }
            Some(action(
                Some(have.to_string()),
                want.to_string(),
                ApplyOp::Resize {
                    disk: layout.disk_key.clone(),
                    size: want,
                },
            ))
        }

        Check::CloudInitDevice => {
            entry.cloud_init_enabled()?;
            let device = &layout.cloudinit_device;
            let current = live.get(device);
            let volume = current.and_then(Volume::parse);
            if volume.as_ref().is_some_and(Volume::is_cloudinit) {
                return None;
            }
            if let Some(media) = volume.as_ref().filter(|v| v.is_media()) {
                warn!(
                    "vm {}: {} holds install media {} instead of a cloud-init drive",
                    entry.id, device, media.name
                );
            }
            let Some(store) = cloudinit_store(entry, live, layout) else {
                warn!(
                    "vm {}: cloud-init enabled but no store for the {} drive (no storage.target, no {} volume)",
                    entry.id, device, layout.disk_key
                );
                return None;
            };

            let drive = format!("{}:cloudinit", store);
            let mut options = vec![(device.clone(), drive.clone())];
            if let Some(boot) = boot_without(live.get("boot"), device, &layout.disk_key) {
                options.push(("boot".to_string(), boot));
            }
            Some(action(
                current.map(str::to_string),
                drive,
                ApplyOp::Set { options },
            ))
        }

        Check::CloudInitIdentity => {
            let ci = entry.cloud_init_enabled()?;
            let mut drifted = false;
            let mut old = Vec::new();
            let mut new = Vec::new();
            let mut options = Vec::new();

            for (key, want) in [("ciuser", &ci.user), ("ipconfig0", &ci.ip_config)] {
                if let Some(want) = want {
                    let have = live.get(key);
                    old.push(format!("{}={}", key, have.unwrap_or("")));
                    new.push(format!("{}={}", key, want));
                    if have != Some(want.as_str()) {
                        drifted = true;
                    }
                    options.push((key.to_string(), want.clone()));
                }
            }
            if let Some(path) = &ci.ssh_keys {
                match fs::read_to_string(path) {
                    Ok(declared) => {
                        let have = live.get("sshkeys").map(parse::decode_ssh_keys);
                        let in_sync = have.as_deref().is_some_and(|have| {
                            parse::ssh_key_lines(have) == parse::ssh_key_lines(&declared)
                        });
                        if !in_sync {
                            drifted = true;
                        }
                        let count = have.as_deref().map_or(0, |h| parse::ssh_key_lines(h).len());
                        old.push(format!("sshkeys=<{} key(s)>", count));
                        new.push(format!("sshkeys={}", path));
                        options.push(("sshkeys".to_string(), path.clone()));
                    }
                    Err(e) => warn!(
                        "vm {}: cannot read sshKeys file {}: {}; key drift not checked",
                        entry.id, path, e
                    ),
                }
            }

            if !drifted {
                return None;
            }
            Some(action(
                Some(old.join(" ")),
                new.join(" "),
                ApplyOp::Set { options },
            ))
        }
    }
}

/// Store for a new cloud-init drive: the declared target, else the primary disk's store
fn cloudinit_store(entry: &ManifestEntry, live: &LiveConfig, layout: &VmConfig) -> Option<String> {
    if let Some(target) = entry.storage_target() {
        return Some(target.to_string());
    }
    live.get(&layout.disk_key)
        .and_then(Volume::parse)
        .and_then(|v| v.storage)
}
