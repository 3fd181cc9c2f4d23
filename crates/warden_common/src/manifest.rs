//! Declared infrastructure manifest
//!
//! The manifest is an ordered JSON array of entries. Every field is read by
//! path through [`crate::query`], so unknown fields are ignored and a field
//! that fails to parse falls back to its documented default.

use crate::error::{Result, WardenError};
use crate::query;
use crate::types::{DesiredState, DiskSize, ResourceKind};
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::warn;

/// Default manifest location
pub const MANIFEST_PATH: &str = "/etc/warden/manifest.json";

/// Documented defaults for optional fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryDefaults {
    pub cpu_model: String,
    pub swap_mb: u64,
    pub sockets: u32,
}

impl Default for EntryDefaults {
    fn default() -> Self {
        Self {
            cpu_model: "x86-64-v2-AES".to_string(),
            swap_mb: 512,
            sockets: 1,
        }
    }
}

/// Source of a new resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Template {
    /// Full clone of an existing resource id
    Clone(u32),
    /// Installable image or container template path
    Image(String),
}

impl Template {
    /// A bare positive integer means "clone from this id"
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if !raw.is_empty() && raw.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(id) = raw.parse::<u32>() {
                if id > 0 {
                    return Template::Clone(id);
                }
            }
        }
        Template::Image(raw.to_string())
    }
}

/// Target store and, for VMs, the declared primary disk size
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_size: Option<DiskSize>,
}

impl StorageSpec {
    fn from_value(value: &Value) -> Option<Self> {
        if let Some(Value::String(s)) = query::lookup(value, "storage") {
            let target = s.trim();
            return if target.is_empty() {
                None
            } else {
                Some(Self {
                    target: Some(target.to_string()),
                    disk_size: None,
                })
            };
        }

        let target = query::string(value, "storage.target");
        let disk_size = match query::lookup(value, "storage.diskSize") {
            Some(Value::Number(n)) => n.as_u64().filter(|g| *g > 0).map(DiskSize::from_gib),
            Some(Value::String(s)) => DiskSize::parse(s),
            _ => None,
        };
        if target.is_none() && disk_size.is_none() {
            None
        } else {
            Some(Self { target, disk_size })
        }
    }
}

/// Cloud-init settings for a VM
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudInit {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Path to a public key file handed to the platform
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_keys: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_config: Option<String>,
}

impl CloudInit {
    fn from_value(value: &Value) -> Option<Self> {
        query::lookup(value, "cloudInit")?;
        Some(Self {
            enabled: query::flag(value, "cloudInit.enabled").unwrap_or(false),
            user: query::string(value, "cloudInit.user"),
            ssh_keys: query::string(value, "cloudInit.sshKeys"),
            ip_config: query::string(value, "cloudInit.ipConfig"),
        })
    }
}

/// One declared resource, with documented defaults already applied.
///
/// Kind-specific fields are `None` for the other kind: `sockets` and
/// `cpu_model` are VM only, `swap` is container only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    #[serde(rename = "type")]
    pub kind: ResourceKind,
    pub id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<Template>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cores: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sockets: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub swap: Option<u64>,
    #[serde(serialize_with = "as_flag")]
    pub on_boot: bool,
    #[serde(serialize_with = "as_flag")]
    pub protection: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud_init: Option<CloudInit>,
    pub state: DesiredState,
}

fn as_flag<S: Serializer>(value: &bool, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_u8(u8::from(*value))
}

impl ManifestEntry {
    /// Build an entry from one manifest element.
    ///
    /// Only `type` and `id` are required; their absence rejects the entry.
    pub fn from_value(value: &Value, defaults: &EntryDefaults) -> std::result::Result<Self, String> {
        let kind = match query::string(value, "type") {
            Some(raw) => ResourceKind::from_str(&raw)
                .ok_or_else(|| format!("unknown resource type '{}'", raw))?,
            None => return Err("missing resource type".to_string()),
        };

        let id = query::integer(value, "id")
            .filter(|id| *id > 0)
            .and_then(|id| u32::try_from(id).ok())
            .ok_or_else(|| "missing or invalid id (expected a positive integer)".to_string())?;

        let state = match query::string(value, "state") {
            Some(raw) => DesiredState::from_str(&raw).unwrap_or_else(|| {
                warn!("id {}: unrecognised state '{}', using default 'running'", id, raw);
                DesiredState::default()
            }),
            None => DesiredState::default(),
        };

        let template = match query::lookup(value, "template") {
            Some(Value::Number(n)) => n
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .filter(|v| *v > 0)
                .map(Template::Clone),
            Some(Value::String(s)) if !s.trim().is_empty() => Some(Template::parse(s)),
            _ => None,
        };

        let cores = query::integer(value, "cores").and_then(|c| u32::try_from(c).ok());
        let is_vm = kind == ResourceKind::Vm;

        let cloud_init = CloudInit::from_value(value);
        if cloud_init.is_some() && !is_vm {
            warn!("id {}: cloudInit is only applied to VMs, ignoring it for a container", id);
        }

        Ok(Self {
            kind,
            id,
            hostname: query::string(value, "hostname"),
            template,
            memory: query::integer(value, "memory"),
            cores,
            sockets: is_vm.then(|| {
                query::integer(value, "sockets")
                    .and_then(|s| u32::try_from(s).ok())
                    .filter(|s| *s > 0)
                    .unwrap_or(defaults.sockets)
            }),
            cpu_model: is_vm.then(|| {
                query::string(value, "cpuModel").unwrap_or_else(|| defaults.cpu_model.clone())
            }),
            network: query::string(value, "network"),
            storage: StorageSpec::from_value(value),
            swap: (!is_vm).then(|| query::integer(value, "swap").unwrap_or(defaults.swap_mb)),
            on_boot: query::flag(value, "onBoot").unwrap_or(false),
            protection: query::flag(value, "protection").unwrap_or(false),
            cloud_init: if is_vm { cloud_init } else { None },
            state,
        })
    }

    /// Cloud-init settings if declared and enabled
    pub fn cloud_init_enabled(&self) -> Option<&CloudInit> {
        self.cloud_init.as_ref().filter(|ci| ci.enabled)
    }

    pub fn storage_target(&self) -> Option<&str> {
        self.storage.as_ref().and_then(|s| s.target.as_deref())
    }

    pub fn disk_size(&self) -> Option<DiskSize> {
        self.storage.as_ref().and_then(|s| s.disk_size)
    }
}

/// Manifest element that could not become an entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedEntry {
    /// Position in the manifest array
    pub index: usize,
    /// Id, if one could be read. Still counts as declared for the audit.
    pub id: Option<u32>,
    pub reason: String,
}

/// One manifest element, accepted or not
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Declaration<'a> {
    Entry(&'a ManifestEntry),
    Rejected(&'a RejectedEntry),
}

/// Parsed manifest
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
    pub rejected: Vec<RejectedEntry>,
    /// Manifest position of each accepted entry
    positions: Vec<usize>,
}

impl Manifest {
    /// Load the manifest file.
    ///
    /// Absence is `ManifestMissing`; unreadable JSON, a non-array document or
    /// a duplicated id is `ManifestInvalid`.
    pub fn load(path: &Path, defaults: &EntryDefaults) -> Result<Self> {
        if !path.exists() {
            return Err(WardenError::ManifestMissing(path.display().to_string()));
        }
        let text = fs::read_to_string(path).map_err(|e| {
            WardenError::ManifestInvalid(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&text, defaults)
    }

    pub fn parse(text: &str, defaults: &EntryDefaults) -> Result<Self> {
        let document: Value = serde_json::from_str(text)
            .map_err(|e| WardenError::ManifestInvalid(format!("not valid JSON: {}", e)))?;
        let items = document.as_array().ok_or_else(|| {
            WardenError::ManifestInvalid("top-level value must be an array of entries".to_string())
        })?;

        let mut manifest = Manifest::default();
        let mut seen = HashSet::new();
        let mut claim = |id: u32| {
            if seen.insert(id) {
                Ok(())
            } else {
                Err(WardenError::ManifestInvalid(format!(
                    "id {} is declared more than once",
                    id
                )))
            }
        };

        for (index, item) in items.iter().enumerate() {
            match ManifestEntry::from_value(item, defaults) {
                Ok(entry) => {
                    claim(entry.id)?;
                    manifest.entries.push(entry);
                    manifest.positions.push(index);
                }
                Err(reason) => {
                    let id = query::integer(item, "id")
                        .filter(|id| *id > 0)
                        .and_then(|id| u32::try_from(id).ok());
                    if let Some(id) = id {
                        claim(id)?;
                    }
                    manifest.rejected.push(RejectedEntry { index, id, reason });
                }
            }
        }

        Ok(manifest)
    }

    /// Accepted and rejected elements in manifest order
    pub fn declarations(&self) -> Vec<Declaration<'_>> {
        let mut ordered: Vec<(usize, Declaration<'_>)> = self
            .entries
            .iter()
            .zip(self.positions.iter().copied())
            .map(|(entry, index)| (index, Declaration::Entry(entry)))
            .chain(self.rejected.iter().map(|r| (r.index, Declaration::Rejected(r))))
            .collect();
        ordered.sort_by_key(|(index, _)| *index);
        ordered.into_iter().map(|(_, d)| d).collect()
    }

    /// Every id the manifest names, including rejected entries that carry one
    pub fn declared_ids(&self) -> HashSet<u32> {
        self.entries
            .iter()
            .map(|e| e.id)
            .chain(self.rejected.iter().filter_map(|r| r.id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn parse(text: &str) -> Result<Manifest> {
        Manifest::parse(text, &EntryDefaults::default())
    }

    #[test]
    fn test_vm_defaults_applied() {
        let m = parse(r#"[{"type":"vm","id":200,"hostname":"web","memory":2048,"cores":2}]"#)
            .unwrap();
        let e = &m.entries[0];
        assert_eq!(e.kind, ResourceKind::Vm);
        assert_eq!(e.sockets, Some(1));
        assert_eq!(e.cpu_model.as_deref(), Some("x86-64-v2-AES"));
        assert_eq!(e.swap, None);
        assert!(!e.on_boot);
        assert!(!e.protection);
        assert_eq!(e.state, DesiredState::Running);
    }

    #[test]
    fn test_container_defaults_applied() {
        let m = parse(r#"[{"type":"container","id":101,"onBoot":1,"state":"stopped"}]"#).unwrap();
        let e = &m.entries[0];
        assert_eq!(e.swap, Some(512));
        assert_eq!(e.sockets, None);
        assert_eq!(e.cpu_model, None);
        assert!(e.on_boot);
        assert_eq!(e.state, DesiredState::Stopped);
    }

    #[test]
    fn test_template_clone_vs_image() {
        let m = parse(
            r#"[
            {"type":"vm","id":201,"template":"9000"},
            {"type":"vm","id":202,"template":9001},
            {"type":"vm","id":203,"template":"local:iso/debian-12.iso"},
            {"type":"container","id":204,"template":"local:vztmpl/debian-12.tar.zst"}
        ]"#,
        )
        .unwrap();
        assert_eq!(m.entries[0].template, Some(Template::Clone(9000)));
        assert_eq!(m.entries[1].template, Some(Template::Clone(9001)));
        assert_eq!(
            m.entries[2].template,
            Some(Template::Image("local:iso/debian-12.iso".to_string()))
        );
        assert!(matches!(m.entries[3].template, Some(Template::Image(_))));
        assert_eq!(Template::parse("0"), Template::Image("0".to_string()));
    }

    #[test]
    fn test_storage_forms() {
        let m = parse(
            r#"[
            {"type":"vm","id":210,"storage":{"target":"local-lvm","diskSize":32}},
            {"type":"vm","id":211,"storage":{"target":"ceph","diskSize":"64G"}},
            {"type":"container","id":212,"storage":"local-zfs"},
            {"type":"vm","id":213,"storage":{"diskSize":"huge"}}
        ]"#,
        )
        .unwrap();
        assert_eq!(m.entries[0].storage_target(), Some("local-lvm"));
        assert_eq!(m.entries[0].disk_size(), Some(DiskSize::from_gib(32)));
        assert_eq!(m.entries[1].disk_size(), Some(DiskSize::from_gib(64)));
        assert_eq!(m.entries[2].storage_target(), Some("local-zfs"));
        assert_eq!(m.entries[2].disk_size(), None);
        assert_eq!(m.entries[3].storage, None);
    }

    #[test]
    fn test_cloud_init_parsing() {
        let m = parse(
            r#"[{"type":"vm","id":220,"storage":"local-lvm",
                 "cloudInit":{"enabled":1,"user":"ops","sshKeys":"/root/.ssh/id.pub","ipConfig":"ip=dhcp"}}]"#,
        )
        .unwrap();
        let ci = m.entries[0].cloud_init_enabled().unwrap();
        assert_eq!(ci.user.as_deref(), Some("ops"));
        assert_eq!(ci.ip_config.as_deref(), Some("ip=dhcp"));

        let disabled =
            parse(r#"[{"type":"vm","id":221,"cloudInit":{"enabled":false,"user":"x"}}]"#).unwrap();
        assert!(disabled.entries[0].cloud_init_enabled().is_none());
    }

    #[test]
    fn test_unknown_fields_and_bad_values_tolerated() {
        let m = parse(
            r#"[{"type":"vm","id":"230","memory":"not-a-number","cores":4,"colour":"blue","state":"paused"}]"#,
        )
        .unwrap();
        let e = &m.entries[0];
        assert_eq!(e.id, 230);
        assert_eq!(e.memory, None);
        assert_eq!(e.cores, Some(4));
        assert_eq!(e.state, DesiredState::Running);
    }

    #[test]
    fn test_rejected_entries_are_isolated() {
        let m = parse(
            r#"[
            {"type":"pod","id":240},
            {"id":241},
            {"type":"vm"},
            {"type":"vm","id":242}
        ]"#,
        )
        .unwrap();
        assert_eq!(m.entries.len(), 1);
        assert_eq!(m.rejected.len(), 3);
        assert_eq!(m.rejected[0].id, Some(240));
        assert_eq!(m.rejected[2].id, None);
        let declared = m.declared_ids();
        assert!(declared.contains(&240));
        assert!(declared.contains(&241));
        assert!(declared.contains(&242));
    }

    #[test]
    fn test_duplicate_id_is_invalid() {
        let err = parse(r#"[{"type":"vm","id":100},{"type":"container","id":100}]"#).unwrap_err();
        assert!(matches!(err, WardenError::ManifestInvalid(_)));

        // A rejected entry still claims its id
        for text in [
            r#"[{"type":"pod","id":100},{"type":"vm","id":100}]"#,
            r#"[{"type":"vm","id":100},{"type":"pod","id":100}]"#,
            r#"[{"id":100},{"memory":512,"id":100}]"#,
        ] {
            assert!(matches!(parse(text).unwrap_err(), WardenError::ManifestInvalid(_)), "{}", text);
        }
    }

    #[test]
    fn test_declarations_follow_manifest_order() {
        let m = parse(
            r#"[
            {"type":"vm","id":200},
            {"type":"pod","id":300},
            {"type":"container","id":101},
            {"memory":512}
        ]"#,
        )
        .unwrap();
        let order: Vec<String> = m
            .declarations()
            .into_iter()
            .map(|d| match d {
                Declaration::Entry(e) => format!("entry {}", e.id),
                Declaration::Rejected(r) => format!("rejected {}", r.index),
            })
            .collect();
        assert_eq!(order, vec!["entry 200", "rejected 1", "entry 101", "rejected 3"]);
    }

    #[test]
    fn test_non_array_is_invalid() {
        assert!(matches!(
            parse(r#"{"type":"vm","id":100}"#).unwrap_err(),
            WardenError::ManifestInvalid(_)
        ));
        assert!(matches!(parse("[{").unwrap_err(), WardenError::ManifestInvalid(_)));
        assert!(parse("[]").unwrap().is_empty());
    }

    #[test]
    fn test_load_missing_file() {
        let temp = TempDir::new().unwrap();
        let err = Manifest::load(&temp.path().join("nope.json"), &EntryDefaults::default())
            .unwrap_err();
        assert!(matches!(err, WardenError::ManifestMissing(_)));
    }

    #[test]
    fn test_load_from_disk() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("manifest.json");
        fs::write(&path, r#"[{"type":"container","id":105,"hostname":"dns"}]"#).unwrap();
        let m = Manifest::load(&path, &EntryDefaults::default()).unwrap();
        assert_eq!(m.len(), 1);
        assert_eq!(m.entries[0].hostname.as_deref(), Some("dns"));
    }

    #[test]
    fn test_entry_serializes_in_manifest_format() {
        let m = parse(
            r#"[{"type":"vm","id":250,"hostname":"db","template":9000,"memory":4096,"cores":2,
                 "onBoot":true,"storage":{"target":"local-lvm","diskSize":40}}]"#,
        )
        .unwrap();
        let v = serde_json::to_value(&m.entries[0]).unwrap();
        assert_eq!(v["type"], json!("vm"));
        assert_eq!(v["template"], json!(9000));
        assert_eq!(v["onBoot"], json!(1));
        assert_eq!(v["protection"], json!(0));
        assert_eq!(v["cpuModel"], json!("x86-64-v2-AES"));
        assert_eq!(v["storage"]["diskSize"], json!("40G"));
        assert!(v.get("swap").is_none());

        // Round-trips through the parser unchanged
        let again = ManifestEntry::from_value(&v, &EntryDefaults::default()).unwrap();
        assert_eq!(again, m.entries[0]);
    }
}
