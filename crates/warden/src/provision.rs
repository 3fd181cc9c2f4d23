//! Creation Provisioner
//!
//! Builds the create / clone command lines for a declared resource that does
//! not exist yet. A blank VM gets its cloud-init drive and identity in the
//! create call. For clones, disk growth and cloud-init wiring are left to the
//! drift pass that follows a live creation.

use crate::platform::Host;
use serde::Serialize;
use tracing::{info, warn};
use warden_common::{
    ManifestEntry, ResourceKind, Result, Template, VmConfig, WardenError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionOutcome {
    Created,
    /// Dry-run: the commands were logged, nothing exists
    Simulated,
}

type Options = Vec<(String, String)>;

fn push<T: ToString>(options: &mut Options, key: &str, value: Option<T>) {
    if let Some(value) = value {
        options.push((key.to_string(), value.to_string()));
    }
}

fn flags(entry: &ManifestEntry, options: &mut Options) {
    push(options, "onboot", Some(u8::from(entry.on_boot)));
    push(options, "protection", Some(u8::from(entry.protection)));
}

/// `pct create` options
pub fn container_options(entry: &ManifestEntry) -> Options {
    let mut options = Options::new();
    push(&mut options, "hostname", entry.hostname.as_ref());
    push(&mut options, "memory", entry.memory);
    push(&mut options, "cores", entry.cores);
    push(&mut options, "swap", entry.swap);
    push(&mut options, "net0", entry.network.as_ref());
    flags(entry, &mut options);

    match (entry.storage_target(), entry.disk_size()) {
        (Some(target), Some(size)) => {
            push(&mut options, "rootfs", Some(format!("{}:{}", target, size.ceil_gib())));
        }
        (Some(target), None) => push(&mut options, "storage", Some(target)),
        (None, Some(_)) => {
            warn!("container {}: disk size declared without a storage target, using platform default", entry.id);
        }
        (None, None) => {}
    }
    options
}

/// Hardware options shared by blank VMs and the follow-up `set` after a clone
pub fn vm_hardware_options(entry: &ManifestEntry) -> Options {
    let mut options = Options::new();
    push(&mut options, "memory", entry.memory);
    push(&mut options, "cores", entry.cores);
    push(&mut options, "sockets", entry.sockets);
    push(&mut options, "cpu", entry.cpu_model.as_ref());
    push(&mut options, "net0", entry.network.as_ref());
    flags(entry, &mut options);
    options
}

/// `qm clone` options (the `--full 1` is part of the command itself)
pub fn vm_clone_options(entry: &ManifestEntry) -> Options {
    let mut options = Options::new();
    push(&mut options, "name", entry.hostname.as_ref());
    push(&mut options, "storage", entry.storage_target());
    options
}

/// `qm create` options for a VM installed from an image
pub fn vm_create_options(entry: &ManifestEntry, image: &str, layout: &VmConfig) -> Result<Options> {
    let (Some(target), Some(size)) = (entry.storage_target(), entry.disk_size()) else {
        return Err(WardenError::Provision {
            id: entry.id,
            reason: "a blank VM needs storage.target and storage.diskSize".to_string(),
        });
    };

    // The cloud-init slot holds the cloud-init drive, never the installer
    let cloud_init = entry.cloud_init_enabled();
    let media_device = if cloud_init.is_some() {
        &layout.install_media_device
    } else {
        &layout.cloudinit_device
    };

    let mut options = Options::new();
    push(&mut options, "name", entry.hostname.as_ref());
    options.extend(vm_hardware_options(entry));
    push(&mut options, "scsihw", Some(&layout.scsihw));
    push(&mut options, &layout.disk_key, Some(format!("{}:{}", target, size.ceil_gib())));
    push(&mut options, media_device, Some(format!("{},media=cdrom", image)));
    push(
        &mut options,
        "boot",
        Some(format!("order={};{}", layout.disk_key, media_device)),
    );
    if let Some(ci) = cloud_init {
        push(&mut options, &layout.cloudinit_device, Some(format!("{}:cloudinit", target)));
        push(&mut options, "ciuser", ci.user.as_ref());
        push(&mut options, "ipconfig0", ci.ip_config.as_ref());
        push(&mut options, "sshkeys", ci.ssh_keys.as_ref());
    }
    Ok(options)
}

pub async fn provision(host: &Host, entry: &ManifestEntry, layout: &VmConfig) -> Result<ProvisionOutcome> {
    let missing = |field: &str| WardenError::Provision {
        id: entry.id,
        reason: format!("{} is required to create a new resource", field),
    };
    if entry.hostname.is_none() {
        return Err(missing("hostname"));
    }
    let template = entry.template.as_ref().ok_or_else(|| missing("template"))?;

    match (entry.kind, template) {
        (ResourceKind::Container, Template::Image(image)) => {
            info!("Creating container {} from {}", entry.id, image);
            host.create(entry.kind, entry.id, Some(image), &container_options(entry))
                .await?;
        }
        (ResourceKind::Container, Template::Clone(source)) => {
            return Err(WardenError::Provision {
                id: entry.id,
                reason: format!("containers are created from a template image, not cloned from {}", source),
            });
        }
        (ResourceKind::Vm, Template::Clone(source)) => {
            info!("Cloning vm {} from {}", entry.id, source);
            host.clone_from(entry.kind, *source, entry.id, &vm_clone_options(entry))
                .await?;
            host.set(entry.kind, entry.id, &vm_hardware_options(entry)).await?;
        }
        (ResourceKind::Vm, Template::Image(image)) => {
            let options = vm_create_options(entry, image, layout)?;
            info!("Creating vm {} from {}", entry.id, image);
            host.create(entry.kind, entry.id, None, &options).await?;
        }
    }

    Ok(if host.is_dry_run() {
        ProvisionOutcome::Simulated
    } else {
        ProvisionOutcome::Created
    })
}
