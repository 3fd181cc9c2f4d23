//! Parsers for loosely structured `pct` / `qm` output.
//!
//! Output is attribute-prefixed text, not a stable schema: anything that
//! does not match the expected shape is skipped.

use std::collections::{BTreeMap, BTreeSet};
use warden_common::{DiskSize, PowerState};

/// Ids from `pct list` / `qm list`: the leading numeric column of each row
pub fn list_ids(output: &str) -> BTreeSet<u32> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter_map(|first| first.parse::<u32>().ok())
        .filter(|id| *id > 0)
        .collect()
}

/// `status: running` from `pct status` / `qm status`
pub fn power_state(output: &str) -> PowerState {
    for line in output.lines() {
        if let Some(value) = line.trim().strip_prefix("status:") {
            return match value.trim() {
                "running" => PowerState::Running,
                "stopped" => PowerState::Stopped,
                _ => PowerState::Unknown,
            };
        }
    }
    PowerState::Unknown
}

/// Current configuration of one resource, keyed by platform option name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveConfig {
    values: BTreeMap<String, String>,
}

impl LiveConfig {
    /// Parse `key: value` lines. Stops at the first snapshot section (`[name]`).
    pub fn parse(output: &str) -> Self {
        let mut values = BTreeMap::new();
        for line in output.lines() {
            let line = line.trim_end();
            if line.starts_with('[') {
                break;
            }
            if line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once(':') {
                let key = key.trim();
                if key.is_empty() || key.contains(char::is_whitespace) {
                    continue;
                }
                values.insert(key.to_string(), value.trim().to_string());
            }
        }
        Self { values }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn flag(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            "1" => Some(true),
            "0" => Some(false),
            _ => None,
        }
    }

    pub fn into_values(self) -> BTreeMap<String, String> {
        self.values
    }
}

/// A volume option such as `local-lvm:vm-100-disk-0,size=32G`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    /// Storage id, when the volume is `<storage>:<name>`
    pub storage: Option<String>,
    /// Volume name, or the whole value for `none` / raw paths
    pub name: String,
    pub options: BTreeMap<String, String>,
}

impl Volume {
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.trim().split(',');
        let head = parts.next()?.trim();
        if head.is_empty() {
            return None;
        }

        let (storage, name) = match head.split_once(':') {
            Some((storage, name)) if !storage.contains('=') => {
                (Some(storage.to_string()), name.to_string())
            }
            _ => (None, head.to_string()),
        };

        let options = parts
            .filter_map(|p| p.split_once('='))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();

        Some(Self {
            storage,
            name,
            options,
        })
    }

    pub fn size(&self) -> Option<DiskSize> {
        self.options.get("size").and_then(|s| DiskSize::parse(s))
    }

    /// Cloud-init drive, e.g. `local-lvm:vm-100-cloudinit`
    pub fn is_cloudinit(&self) -> bool {
        self.name.contains("cloudinit")
    }

    /// Installer or other optical media occupying the slot
    pub fn is_media(&self) -> bool {
        !self.is_cloudinit()
            && (self.options.get("media").map(String::as_str) == Some("cdrom")
                || self.name.contains("iso/")
                || self.name.ends_with(".iso"))
    }
}

/// Public keys as the platform stores them in `sshkeys`: percent-encoded,
/// everything but unreserved characters escaped.
pub fn encode_ssh_keys(keys: &str) -> String {
    let mut out = String::with_capacity(keys.len());
    for byte in keys.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(char::from(byte))
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Inverse of [`encode_ssh_keys`]. Malformed escapes are kept literally.
pub fn decode_ssh_keys(stored: &str) -> String {
    let bytes = stored.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// One key per line, trimmed, blank lines dropped
pub fn ssh_key_lines(keys: &str) -> Vec<&str> {
    keys.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect()
}
