//! Platform capability per resource kind
//!
//! [`Lifecycle`] knows how to spell each operation for one kind (`pct` for
//! containers, `qm` for VMs). [`Host`] pairs both with an [`Executor`] so the
//! rest of the engine can run one orchestration path for either kind.

use crate::executor::{CallBudget, Executor, Invocation, MutationStats};
use crate::parse::{self, LiveConfig};
use std::collections::BTreeSet;
use warden_common::{
    ApplyOp, PowerState, ReconciliationAction, ResourceKind, Result, WardenConfig, WardenError,
};

/// Command vocabulary for one resource kind
pub trait Lifecycle: Send + Sync {
    fn kind(&self) -> ResourceKind;

    fn program(&self) -> &str;

    /// Config key that holds the resource's hostname
    fn hostname_key(&self) -> &'static str;

    fn list(&self) -> Invocation {
        Invocation::new(self.program(), ["list"])
    }

    fn status(&self, id: u32) -> Invocation {
        Invocation::new(self.program(), ["status".to_string(), id.to_string()])
    }

    fn config(&self, id: u32) -> Invocation {
        Invocation::new(self.program(), ["config".to_string(), id.to_string()])
    }

    fn set(&self, id: u32, options: &[(String, String)]) -> Invocation {
        Invocation::new(self.program(), ["set".to_string(), id.to_string()]).options(options)
    }

    fn start(&self, id: u32) -> Invocation {
        Invocation::new(self.program(), ["start".to_string(), id.to_string()])
    }

    fn shutdown(&self, id: u32, timeout_secs: u64) -> Invocation {
        Invocation::new(
            self.program(),
            [
                "shutdown".to_string(),
                id.to_string(),
                "--timeout".to_string(),
                timeout_secs.to_string(),
            ],
        )
    }

    fn stop(&self, id: u32) -> Invocation {
        Invocation::new(self.program(), ["stop".to_string(), id.to_string()])
    }

    /// Create a new resource with the given options.
    fn create(&self, id: u32, image: Option<&str>, options: &[(String, String)]) -> Invocation;

    /// Full clone of `source` into `id`, if this kind supports it
    fn clone_from(&self, source: u32, id: u32, options: &[(String, String)]) -> Option<Invocation>;

    /// Grow a disk to an absolute size, if this kind supports it
    fn resize(&self, id: u32, disk: &str, size: &str) -> Option<Invocation>;
}

/// `pct`, the container toolkit
#[derive(Debug, Clone)]
pub struct Pct {
    bin: String,
}

impl Pct {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }
}

impl Lifecycle for Pct {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Container
    }

    fn program(&self) -> &str {
        &self.bin
    }

    fn hostname_key(&self) -> &'static str {
        "hostname"
    }

    fn create(&self, id: u32, image: Option<&str>, options: &[(String, String)]) -> Invocation {
        let mut inv = Invocation::new(&self.bin, ["create".to_string(), id.to_string()]);
        if let Some(image) = image {
            inv = inv.arg(image);
        }
        inv.options(options)
    }

    fn clone_from(&self, _source: u32, _id: u32, _options: &[(String, String)]) -> Option<Invocation> {
        None
    }

    fn resize(&self, _id: u32, _disk: &str, _size: &str) -> Option<Invocation> {
        None
    }
}

/// `qm`, the VM toolkit
#[derive(Debug, Clone)]
pub struct Qm {
    bin: String,
}

impl Qm {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }
}

impl Lifecycle for Qm {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Vm
    }

    fn program(&self) -> &str {
        &self.bin
    }

    fn hostname_key(&self) -> &'static str {
        "name"
    }

    fn create(&self, id: u32, _image: Option<&str>, options: &[(String, String)]) -> Invocation {
        Invocation::new(&self.bin, ["create".to_string(), id.to_string()]).options(options)
    }

    fn clone_from(&self, source: u32, id: u32, options: &[(String, String)]) -> Option<Invocation> {
        Some(
            Invocation::new(
                &self.bin,
                [
                    "clone".to_string(),
                    source.to_string(),
                    id.to_string(),
                    "--full".to_string(),
                    "1".to_string(),
                ],
            )
            .options(options),
        )
    }

    fn resize(&self, id: u32, disk: &str, size: &str) -> Option<Invocation> {
        Some(Invocation::new(
            &self.bin,
            ["resize".to_string(), id.to_string(), disk.to_string(), size.to_string()],
        ))
    }
}

/// The hypervisor host, as seen through its command interface
pub struct Host {
    executor: Executor,
    pct: Pct,
    qm: Qm,
    shutdown_timeout_secs: u64,
}

impl Host {
    pub fn new(executor: Executor, config: &WardenConfig) -> Self {
        Self {
            executor,
            pct: Pct::new(&config.pct_bin),
            qm: Qm::new(&config.qm_bin),
            shutdown_timeout_secs: config.shutdown_timeout_secs,
        }
    }

    pub fn lifecycle(&self, kind: ResourceKind) -> &dyn Lifecycle {
        match kind {
            ResourceKind::Container => &self.pct,
            ResourceKind::Vm => &self.qm,
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.executor.is_dry_run()
    }

    pub fn stats(&self) -> MutationStats {
        self.executor.stats()
    }

    pub async fn list_ids(&self, kind: ResourceKind) -> Result<BTreeSet<u32>> {
        let out = self.executor.query(&self.lifecycle(kind).list()).await?;
        Ok(parse::list_ids(&out))
    }

    pub async fn power_state(&self, kind: ResourceKind, id: u32) -> Result<PowerState> {
        let out = self.executor.query(&self.lifecycle(kind).status(id)).await?;
        Ok(parse::power_state(&out))
    }

    pub async fn config(&self, kind: ResourceKind, id: u32) -> Result<LiveConfig> {
        let out = self.executor.query(&self.lifecycle(kind).config(id)).await?;
        Ok(LiveConfig::parse(&out))
    }

    pub async fn set(&self, kind: ResourceKind, id: u32, options: &[(String, String)]) -> Result<()> {
        if options.is_empty() {
            return Ok(());
        }
        self.executor
            .mutate(&self.lifecycle(kind).set(id, options), CallBudget::Short)
            .await
    }

    /// Run the platform operation behind a reconciliation action
    pub async fn apply(&self, action: &ReconciliationAction) -> Result<()> {
        match &action.op {
            ApplyOp::Set { options } => self.set(action.kind, action.id, options).await,
            ApplyOp::Resize { disk, size } => {
                let lifecycle = self.lifecycle(action.kind);
                let inv = lifecycle
                    .resize(action.id, disk, &size.to_string())
                    .ok_or_else(|| {
                        WardenError::command_failure(
                            format!("{} resize {}", lifecycle.program(), action.id),
                            -1,
                            format!("{} disks cannot be resized", action.kind),
                        )
                    })?;
                self.executor.mutate(&inv, CallBudget::Long).await
            }
        }
    }

    pub async fn start(&self, kind: ResourceKind, id: u32) -> Result<()> {
        self.executor
            .mutate(&self.lifecycle(kind).start(id), CallBudget::Short)
            .await
    }

    pub async fn graceful_stop(&self, kind: ResourceKind, id: u32) -> Result<()> {
        let inv = self.lifecycle(kind).shutdown(id, self.shutdown_timeout_secs);
        self.executor.mutate(&inv, CallBudget::Short).await
    }

    pub async fn force_stop(&self, kind: ResourceKind, id: u32) -> Result<()> {
        self.executor
            .mutate(&self.lifecycle(kind).stop(id), CallBudget::Short)
            .await
    }

    pub async fn create(
        &self,
        kind: ResourceKind,
        id: u32,
        image: Option<&str>,
        options: &[(String, String)],
    ) -> Result<()> {
        let inv = self.lifecycle(kind).create(id, image, options);
        self.executor.mutate(&inv, CallBudget::Long).await
    }

    pub async fn clone_from(
        &self,
        kind: ResourceKind,
        source: u32,
        id: u32,
        options: &[(String, String)],
    ) -> Result<()> {
        let lifecycle = self.lifecycle(kind);
        let inv = lifecycle.clone_from(source, id, options).ok_or_else(|| {
            WardenError::Provision {
                id,
                reason: format!("{} resources cannot be cloned", kind),
            }
        })?;
        self.executor.mutate(&inv, CallBudget::Long).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_pct_invocations() {
        let pct = Pct::new("pct");
        assert_eq!(pct.list().to_string(), "pct list");
        assert_eq!(pct.status(101).to_string(), "pct status 101");
        assert_eq!(pct.shutdown(101, 60).to_string(), "pct shutdown 101 --timeout 60");
        assert_eq!(
            pct.set(101, &opts(&[("memory", "2048")])).to_string(),
            "pct set 101 --memory 2048"
        );
        assert_eq!(
            pct.create(101, Some("local:vztmpl/debian.tar.zst"), &opts(&[("cores", "2")]))
                .to_string(),
            "pct create 101 local:vztmpl/debian.tar.zst --cores 2"
        );
        assert!(pct.clone_from(9000, 101, &[]).is_none());
        assert!(pct.resize(101, "rootfs", "8G").is_none());
        assert_eq!(pct.hostname_key(), "hostname");
    }

    #[test]
    fn test_qm_invocations() {
        let qm = Qm::new("/usr/sbin/qm");
        assert_eq!(qm.stop(200).to_string(), "/usr/sbin/qm stop 200");
        assert_eq!(
            qm.clone_from(9000, 200, &opts(&[("name", "web")])).unwrap().to_string(),
            "/usr/sbin/qm clone 9000 200 --full 1 --name web"
        );
        assert_eq!(
            qm.resize(200, "scsi0", "64G").unwrap().to_string(),
            "/usr/sbin/qm resize 200 scsi0 64G"
        );
        assert_eq!(
            qm.create(200, Some("ignored"), &opts(&[("name", "web")])).to_string(),
            "/usr/sbin/qm create 200 --name web"
        );
        assert_eq!(qm.hostname_key(), "name");
    }
}
