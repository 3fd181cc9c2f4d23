//! Core types shared between the manifest model and the engine.

use crate::manifest::ManifestEntry;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of workload on the host. Containers and VMs share one id space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Container,
    Vm,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 2] = [ResourceKind::Container, ResourceKind::Vm];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Container => "container",
            ResourceKind::Vm => "vm",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "container" | "ct" | "lxc" => Some(ResourceKind::Container),
            "vm" | "qemu" => Some(ResourceKind::Vm),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed power state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    Running,
    Stopped,
    Unknown,
}

impl PowerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerState::Running => "running",
            PowerState::Stopped => "stopped",
            PowerState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared power intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    #[default]
    Running,
    Stopped,
}

impl DesiredState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DesiredState::Running => "running",
            DesiredState::Stopped => "stopped",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "running" | "started" => Some(DesiredState::Running),
            "stopped" => Some(DesiredState::Stopped),
            _ => None,
        }
    }
}

impl fmt::Display for DesiredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Disk size in MiB.
///
/// The platform reports sizes as `32G`, `512M` or `1T`; a bare number is GiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DiskSize {
    mib: u64,
}

impl DiskSize {
    pub fn from_mib(mib: u64) -> Self {
        Self { mib }
    }

    pub fn from_gib(gib: u64) -> Self {
        Self {
            mib: gib.saturating_mul(1024),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit() && c != '.') {
            Some(pos) => (&s[..pos], s[pos..].trim()),
            None => (s, "G"),
        };
        let value: f64 = digits.parse().ok()?;
        let factor = match unit.to_ascii_uppercase().trim_end_matches('B') {
            "K" => 1.0 / 1024.0,
            "M" => 1.0,
            "G" | "" => 1024.0,
            "T" => 1024.0 * 1024.0,
            _ => return None,
        };
        let mib = (value * factor).round();
        if mib < 1.0 {
            return None;
        }
        Some(Self { mib: mib as u64 })
    }

    pub fn mib(&self) -> u64 {
        self.mib
    }

    /// Whole GiB, rounded up. Used where the platform allocates in GiB.
    pub fn ceil_gib(&self) -> u64 {
        self.mib.div_ceil(1024)
    }
}

impl fmt::Display for DiskSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.mib % (1024 * 1024) == 0 {
            write!(f, "{}T", self.mib / (1024 * 1024))
        } else if self.mib % 1024 == 0 {
            write!(f, "{}G", self.mib / 1024)
        } else {
            write!(f, "{}M", self.mib)
        }
    }
}

impl Serialize for DiskSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// Platform operation that applies a corrective action
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ApplyOp {
    /// `set <id> --key value ...`
    Set { options: Vec<(String, String)> },
    /// `resize <id> <disk> <size>`
    Resize { disk: String, size: DiskSize },
}

/// One corrective step produced by drift detection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationAction {
    pub id: u32,
    pub kind: ResourceKind,
    pub attribute: String,
    pub old_value: Option<String>,
    pub new_value: String,
    /// Requires stop / apply / start
    pub cold: bool,
    pub op: ApplyOp,
}

impl ReconciliationAction {
    pub fn describe(&self) -> String {
        format!(
            "{} {}: {} {} -> {}",
            self.kind,
            self.id,
            self.attribute,
            self.old_value.as_deref().unwrap_or("<unset>"),
            self.new_value
        )
    }
}

/// A host resource that the manifest does not declare
#[derive(Debug, Clone, Serialize)]
pub struct AuditFinding {
    pub id: u32,
    pub kind: ResourceKind,
    /// Raw observed configuration, as reported by the platform
    pub observed: BTreeMap<String, String>,
    pub power_state: PowerState,
    pub suggested: ManifestEntry,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_kind_parsing() {
        assert_eq!(ResourceKind::from_str("container"), Some(ResourceKind::Container));
        assert_eq!(ResourceKind::from_str(" VM "), Some(ResourceKind::Vm));
        assert_eq!(ResourceKind::from_str("pod"), None);
        assert_eq!(ResourceKind::Vm.to_string(), "vm");
    }

    #[test]
    fn test_desired_state_parsing() {
        assert_eq!(DesiredState::from_str("stopped"), Some(DesiredState::Stopped));
        assert_eq!(DesiredState::from_str("Running"), Some(DesiredState::Running));
        assert_eq!(DesiredState::from_str("paused"), None);
        assert_eq!(DesiredState::default(), DesiredState::Running);
    }

    #[test]
    fn test_disk_size_parse_units() {
        assert_eq!(DiskSize::parse("32G"), Some(DiskSize::from_gib(32)));
        assert_eq!(DiskSize::parse("32"), Some(DiskSize::from_gib(32)));
        assert_eq!(DiskSize::parse("512M"), Some(DiskSize::from_mib(512)));
        assert_eq!(DiskSize::parse("1T"), Some(DiskSize::from_gib(1024)));
        assert_eq!(DiskSize::parse("1.5G"), Some(DiskSize::from_mib(1536)));
        assert_eq!(DiskSize::parse("10GB"), Some(DiskSize::from_gib(10)));
        assert_eq!(DiskSize::parse(""), None);
        assert_eq!(DiskSize::parse("lots"), None);
        assert_eq!(DiskSize::parse("5X"), None);
    }

    #[test]
    fn test_disk_size_display_and_order() {
        assert_eq!(DiskSize::from_gib(32).to_string(), "32G");
        assert_eq!(DiskSize::from_mib(1536).to_string(), "1536M");
        assert_eq!(DiskSize::from_gib(2048).to_string(), "2T");
        assert!(DiskSize::from_gib(64) > DiskSize::from_gib(32));
        assert_eq!(DiskSize::from_mib(1536).ceil_gib(), 2);
    }

    #[test]
    fn test_action_describe() {
        let action = ReconciliationAction {
            id: 101,
            kind: ResourceKind::Container,
            attribute: "memory".to_string(),
            old_value: Some("1024".to_string()),
            new_value: "2048".to_string(),
            cold: true,
            op: ApplyOp::Set {
                options: vec![("memory".to_string(), "2048".to_string())],
            },
        };
        assert_eq!(action.describe(), "container 101: memory 1024 -> 2048");
    }
}
