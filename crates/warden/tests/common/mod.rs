//! Shared harness: a temp directory holding the manifest, lock and journal,
//! and a FakeHost standing in for the hypervisor.

#![allow(dead_code)]

use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use warden::fake::FakeHost;
use warden::{Coordinator, RunOptions, RunReport};
use warden_common::{PowerState, Result, WardenConfig};

pub struct Harness {
    pub temp: TempDir,
    pub config: WardenConfig,
    pub fake: Arc<FakeHost>,
}

impl Harness {
    pub fn new(fake: FakeHost, manifest: Value) -> Self {
        let temp = TempDir::new().unwrap();
        let manifest_path = temp.path().join("manifest.json");
        std::fs::write(&manifest_path, manifest.to_string()).unwrap();

        let config = WardenConfig {
            manifest_path,
            lock_path: temp.path().join("warden.lock"),
            lock_wait_secs: 0,
            ops_log_path: Some(temp.path().join("ops.log")),
            ..WardenConfig::default()
        };
        Self {
            temp,
            config,
            fake: Arc::new(fake),
        }
    }

    pub fn write_manifest(&self, text: &str) {
        std::fs::write(&self.config.manifest_path, text).unwrap();
    }

    /// Write a file into the harness directory and return its path
    pub fn write_file(&self, name: &str, content: &str) -> String {
        let path = self.temp.path().join(name);
        std::fs::write(&path, content).unwrap();
        path.display().to_string()
    }

    pub fn ops_log(&self) -> PathBuf {
        self.temp.path().join("ops.log")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.config.lock_path.clone()
    }

    async fn run_with(&self, dry_run: bool) -> Result<RunReport> {
        let options = RunOptions {
            dry_run,
            manifest_path: None,
            lock_wait: Some(Duration::from_millis(0)),
        };
        Coordinator::new(self.config.clone(), self.fake.clone(), options)
            .run()
            .await
    }

    pub async fn run(&self) -> Result<RunReport> {
        self.run_with(false).await
    }

    pub async fn dry_run(&self) -> Result<RunReport> {
        self.run_with(true).await
    }

    /// Run live, then run again and return the mutating calls of the second pass
    pub async fn rerun_mutations(&self) -> Vec<String> {
        self.run().await.unwrap();
        self.fake.clear_calls();
        self.run().await.unwrap();
        self.fake.mutating_calls()
    }
}

pub const CT_NET: &str = "name=eth0,bridge=vmbr0,hwaddr=BC:24:11:AA:BB:01,ip=dhcp,type=veth";
pub const VM_NET: &str = "virtio=BC:24:11:00:00:01,bridge=vmbr0";

/// Container 101 "dns" as the host reports it
pub fn dns_container(memory: &'static str) -> FakeHost {
    FakeHost::new().with_container(
        101,
        PowerState::Running,
        &[
            ("hostname", "dns"),
            ("memory", memory),
            ("cores", "2"),
            ("swap", "512"),
            ("net0", CT_NET),
            ("onboot", "1"),
            ("rootfs", "local-lvm:vm-101-disk-0,size=8G"),
        ],
    )
}

pub fn dns_entry(memory: u64) -> Value {
    serde_json::json!({
        "type": "container",
        "id": 101,
        "hostname": "dns",
        "template": "local:vztmpl/debian-12-standard_12.7-1_amd64.tar.zst",
        "memory": memory,
        "cores": 2,
        "network": "name=eth0,bridge=vmbr0,ip=dhcp",
        "storage": {"target": "local-lvm", "diskSize": 8},
        "onBoot": 1
    })
}

/// VM 200 "web" as the host reports it
pub fn web_vm(fake: FakeHost, disk: &'static str) -> FakeHost {
    fake.with_vm(
        200,
        PowerState::Running,
        &[
            ("name", "web"),
            ("memory", "2048"),
            ("cores", "2"),
            ("cpu", "x86-64-v2-AES"),
            ("net0", VM_NET),
            ("scsi0", disk),
            ("boot", "order=scsi0"),
        ],
    )
}

pub fn web_entry(disk_gb: u64) -> Value {
    serde_json::json!({
        "type": "vm",
        "id": 200,
        "hostname": "web",
        "template": "local:iso/debian-12.7.0-amd64-netinst.iso",
        "memory": 2048,
        "cores": 2,
        "network": "virtio,bridge=vmbr0",
        "storage": {"target": "local-lvm", "diskSize": disk_gb}
    })
}
