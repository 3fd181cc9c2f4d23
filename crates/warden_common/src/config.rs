//! Configuration management for warden.
//!
//! Loads settings from /etc/warden/config.toml or uses defaults.

use crate::error::{Result, WardenError};
use crate::manifest::{EntryDefaults, MANIFEST_PATH};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Config file path
pub const CONFIG_PATH: &str = "/etc/warden/config.toml";

/// Documented defaults for optional manifest fields
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// CPU model for VMs that do not declare one
    #[serde(default = "default_cpu_model")]
    pub cpu_model: String,

    /// Container swap in MB
    #[serde(default = "default_swap_mb")]
    pub swap_mb: u64,

    /// VM sockets
    #[serde(default = "default_sockets")]
    pub sockets: u32,
}

fn default_cpu_model() -> String {
    "x86-64-v2-AES".to_string()
}

fn default_swap_mb() -> u64 {
    512
}

fn default_sockets() -> u32 {
    1
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            cpu_model: default_cpu_model(),
            swap_mb: default_swap_mb(),
            sockets: default_sockets(),
        }
    }
}

/// VM device layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfig {
    /// Primary disk, grown when the declared size exceeds it
    #[serde(default = "default_disk_key")]
    pub disk_key: String,

    /// Device slot that must hold the cloud-init drive
    #[serde(default = "default_cloudinit_device")]
    pub cloudinit_device: String,

    /// Slot for installer media when the cloud-init slot is reserved
    #[serde(default = "default_install_media_device")]
    pub install_media_device: String,

    /// SCSI controller for newly created VMs
    #[serde(default = "default_scsihw")]
    pub scsihw: String,
}

fn default_disk_key() -> String {
    "scsi0".to_string()
}

fn default_cloudinit_device() -> String {
    "ide2".to_string()
}

fn default_install_media_device() -> String {
    "ide0".to_string()
}

fn default_scsihw() -> String {
    "virtio-scsi-pci".to_string()
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            disk_key: default_disk_key(),
            cloudinit_device: default_cloudinit_device(),
            install_media_device: default_install_media_device(),
            scsihw: default_scsihw(),
        }
    }
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WardenConfig {
    #[serde(default = "default_manifest_path")]
    pub manifest_path: PathBuf,

    #[serde(default = "default_lock_path")]
    pub lock_path: PathBuf,

    /// How long a run waits for the lock before giving up
    #[serde(default = "default_lock_wait")]
    pub lock_wait_secs: u64,

    /// A lock older than this is recovered even if its PID is alive
    #[serde(default = "default_lock_stale")]
    pub lock_stale_secs: u64,

    /// Per-call ceiling for queries, set, start and stop
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Per-call ceiling for create, clone and resize
    #[serde(default = "default_long_command_timeout")]
    pub long_command_timeout_secs: u64,

    /// Passed to graceful shutdown before falling back to a forced stop
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Journal of executed mutating commands; empty disables it
    #[serde(default = "default_ops_log_path")]
    pub ops_log_path: Option<PathBuf>,

    #[serde(default = "default_pct_bin")]
    pub pct_bin: String,

    #[serde(default = "default_qm_bin")]
    pub qm_bin: String,

    #[serde(default)]
    pub defaults: DefaultsConfig,

    #[serde(default)]
    pub vm: VmConfig,
}

fn default_manifest_path() -> PathBuf {
    PathBuf::from(MANIFEST_PATH)
}

fn default_lock_path() -> PathBuf {
    PathBuf::from("/run/lock/warden.lock")
}

fn default_lock_wait() -> u64 {
    60
}

fn default_lock_stale() -> u64 {
    6 * 3600
}

fn default_command_timeout() -> u64 {
    120
}

fn default_long_command_timeout() -> u64 {
    900
}

fn default_shutdown_timeout() -> u64 {
    60
}

fn default_ops_log_path() -> Option<PathBuf> {
    Some(PathBuf::from("/var/log/warden/ops.log"))
}

fn default_pct_bin() -> String {
    "pct".to_string()
}

fn default_qm_bin() -> String {
    "qm".to_string()
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            manifest_path: default_manifest_path(),
            lock_path: default_lock_path(),
            lock_wait_secs: default_lock_wait(),
            lock_stale_secs: default_lock_stale(),
            command_timeout_secs: default_command_timeout(),
            long_command_timeout_secs: default_long_command_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            ops_log_path: default_ops_log_path(),
            pct_bin: default_pct_bin(),
            qm_bin: default_qm_bin(),
            defaults: DefaultsConfig::default(),
            vm: VmConfig::default(),
        }
    }
}

impl WardenConfig {
    /// Load config from `path`, or from [`CONFIG_PATH`] when `None`.
    ///
    /// A missing file at the default location yields defaults. A missing
    /// file that was asked for explicitly is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(CONFIG_PATH), false),
        };

        if !path.exists() {
            if explicit {
                return Err(WardenError::Config(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .map_err(|e| WardenError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config = Self::parse(&content)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Self =
            toml::from_str(content).map_err(|e| WardenError::Config(e.to_string()))?;
        if config
            .ops_log_path
            .as_ref()
            .is_some_and(|p| p.as_os_str().is_empty())
        {
            config.ops_log_path = None;
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.command_timeout_secs == 0 || self.long_command_timeout_secs == 0 {
            return Err(WardenError::Config(
                "command timeouts must be greater than zero".to_string(),
            ));
        }
        if self.pct_bin.trim().is_empty() || self.qm_bin.trim().is_empty() {
            return Err(WardenError::Config("pct_bin and qm_bin must be set".to_string()));
        }
        if self.vm.disk_key == self.vm.cloudinit_device {
            return Err(WardenError::Config(format!(
                "vm.disk_key and vm.cloudinit_device are both '{}'",
                self.vm.disk_key
            )));
        }
        Ok(())
    }

    pub fn entry_defaults(&self) -> EntryDefaults {
        EntryDefaults {
            cpu_model: self.defaults.cpu_model.clone(),
            swap_mb: self.defaults.swap_mb,
            sockets: self.defaults.sockets,
        }
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait_secs)
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.lock_stale_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn long_command_timeout(&self) -> Duration {
        Duration::from_secs(self.long_command_timeout_secs)
    }
}
