//! In-memory hypervisor host for deterministic testing
//!
//! [`FakeHost`] implements [`CommandRunner`] by interpreting `pct` / `qm`
//! invocations against a table of simulated resources. Every call is
//! recorded so tests can assert on exactly what the engine issued.
//!
//! ```ignore
//! let fake = FakeHost::new()
//!     .with_container(101, PowerState::Running, &[("hostname", "dns"), ("memory", "1024")])
//!     .fail_on("qm start 200");
//! ```

use crate::executor::{CommandOutput, CommandRunner, Invocation};
use crate::parse;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use warden_common::{DiskSize, PowerState, ResourceKind, Result, WardenError};

/// Subcommands that change host state
pub const MUTATING_SUBCOMMANDS: &[&str] =
    &["set", "resize", "start", "shutdown", "stop", "create", "clone"];

// ============================================================================
// Simulated resources
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeResource {
    pub kind: ResourceKind,
    pub power: PowerState,
    pub config: BTreeMap<String, String>,
}

impl FakeResource {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.config.get(key).map(String::as_str)
    }

    /// Size of the primary disk (`rootfs` or `scsi0`)
    pub fn disk_size(&self) -> Option<DiskSize> {
        let key = match self.kind {
            ResourceKind::Container => "rootfs",
            ResourceKind::Vm => "scsi0",
        };
        self.get(key)?
            .split(',')
            .filter_map(|p| p.strip_prefix("size="))
            .find_map(DiskSize::parse)
    }
}

#[derive(Debug, Default)]
struct FakeState {
    resources: BTreeMap<u32, FakeResource>,
    calls: Vec<Invocation>,
    fail_on: Vec<String>,
    time_out_on: Vec<String>,
    ignore_shutdown: BTreeSet<u32>,
}

// ============================================================================
// Fake Host
// ============================================================================

/// Simulated `pct` / `qm` host
#[derive(Debug, Default)]
pub struct FakeHost {
    state: Mutex<FakeState>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_resource(
        self,
        kind: ResourceKind,
        id: u32,
        power: PowerState,
        config: &[(&str, &str)],
    ) -> Self {
        let config = config
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.state()
            .resources
            .insert(id, FakeResource { kind, power, config });
        self
    }

    pub fn with_container(self, id: u32, power: PowerState, config: &[(&str, &str)]) -> Self {
        self.with_resource(ResourceKind::Container, id, power, config)
    }

    pub fn with_vm(self, id: u32, power: PowerState, config: &[(&str, &str)]) -> Self {
        self.with_resource(ResourceKind::Vm, id, power, config)
    }

    /// Any call whose rendered command line contains `pattern` exits non-zero
    pub fn fail_on(self, pattern: &str) -> Self {
        self.state().fail_on.push(pattern.to_string());
        self
    }

    /// Any call whose rendered command line contains `pattern` times out
    pub fn time_out_on(self, pattern: &str) -> Self {
        self.state().time_out_on.push(pattern.to_string());
        self
    }

    /// Graceful shutdown of `id` succeeds but the guest keeps running
    pub fn ignore_shutdown(self, id: u32) -> Self {
        self.state().ignore_shutdown.insert(id);
        self
    }

    pub fn resource(&self, id: u32) -> Option<FakeResource> {
        self.state().resources.get(&id).cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.iter().map(ToString::to_string).collect()
    }

    pub fn mutating_calls(&self) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter(|inv| {
                inv.args
                    .first()
                    .is_some_and(|sub| MUTATING_SUBCOMMANDS.contains(&sub.as_str()))
            })
            .map(ToString::to_string)
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }
}

#[async_trait]
impl CommandRunner for FakeHost {
    async fn run(&self, invocation: &Invocation, timeout: Duration) -> Result<CommandOutput> {
        let mut state = self.state();
        state.calls.push(invocation.clone());
        let line = invocation.to_string();

        if state.time_out_on.iter().any(|p| line.contains(p.as_str())) {
            return Err(WardenError::CommandTimeout {
                command: line,
                secs: timeout.as_secs(),
            });
        }
        if state.fail_on.iter().any(|p| line.contains(p.as_str())) {
            return Ok(failure(255, "simulated failure"));
        }

        let kind = match program_kind(&invocation.program) {
            Some(kind) => kind,
            None => {
                return Err(WardenError::CommandSpawn {
                    command: line,
                    reason: "No such file or directory".to_string(),
                })
            }
        };
        Ok(state.dispatch(kind, &invocation.args))
    }
}

fn program_kind(program: &str) -> Option<ResourceKind> {
    match program.rsplit('/').next()? {
        "pct" => Some(ResourceKind::Container),
        "qm" => Some(ResourceKind::Vm),
        _ => None,
    }
}

fn success(stdout: impl Into<String>) -> CommandOutput {
    CommandOutput {
        code: 0,
        stdout: stdout.into(),
        stderr: String::new(),
    }
}

fn failure(code: i32, stderr: impl Into<String>) -> CommandOutput {
    CommandOutput {
        code,
        stdout: String::new(),
        stderr: stderr.into(),
    }
}

/// Split `--key value` pairs following the positional arguments
fn options(args: &[String]) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if let Some(key) = arg.strip_prefix("--") {
            let value = iter.next().cloned().unwrap_or_default();
            out.push((key.to_string(), value));
        }
    }
    out
}

/// Value as the platform stores it: cloud-init drives are allocated and
/// `sshkeys` names a key file whose contents are saved percent-encoded.
fn stored_value(key: &str, value: String, id: u32) -> std::result::Result<String, CommandOutput> {
    if let Some(store) = value.strip_suffix(":cloudinit") {
        return Ok(format!("{}:vm-{}-cloudinit,media=cdrom", store, id));
    }
    if key == "sshkeys" {
        return std::fs::read_to_string(&value)
            .map(|keys| parse::encode_ssh_keys(&keys))
            .map_err(|e| failure(255, format!("sshkeys: unable to read '{}': {}", value, e)));
    }
    Ok(value)
}

fn disk_volume(spec: &str, id: u32, index: usize) -> String {
    // `<store>:<GB>` allocates a new volume
    match spec.split_once(':') {
        Some((store, size)) if size.chars().all(|c| c.is_ascii_digit()) && !size.is_empty() => {
            format!("{}:vm-{}-disk-{},size={}G", store, id, index, size)
        }
        _ => spec.to_string(),
    }
}

impl FakeState {
    fn dispatch(&mut self, kind: ResourceKind, args: &[String]) -> CommandOutput {
        let Some(sub) = args.first().map(String::as_str) else {
            return failure(255, "no command specified");
        };
        if sub == "list" {
            return self.list(kind);
        }

        let id = match args.get(1).and_then(|a| a.parse::<u32>().ok()) {
            Some(id) => id,
            None => return failure(255, "missing vmid"),
        };

        match sub {
            "create" => return self.create(kind, id, &args[2..]),
            "clone" => return self.clone_vm(kind, id, &args[2..]),
            _ => {}
        }

        let Some(res) = self.resources.get_mut(&id).filter(|r| r.kind == kind) else {
            return failure(2, format!("Configuration file for {} {} does not exist", kind, id));
        };

        match sub {
            "status" => success(format!("status: {}\n", res.power)),
            "config" => success(
                res.config
                    .iter()
                    .map(|(k, v)| format!("{}: {}\n", k, v))
                    .collect::<String>(),
            ),
            "set" => {
                let mut updates = Vec::new();
                for (key, value) in options(&args[2..]) {
                    match stored_value(&key, value, id) {
                        Ok(value) => updates.push((key, value)),
                        Err(out) => return out,
                    }
                }
                res.config.extend(updates);
                success("")
            }
            "resize" => {
                let (Some(disk), Some(size)) = (args.get(2), args.get(3)) else {
                    return failure(255, "usage: resize <vmid> <disk> <size>");
                };
                let Some(want) = DiskSize::parse(size) else {
                    return failure(255, format!("invalid size '{}'", size));
                };
                let Some(current) = res.config.get(disk).cloned() else {
                    return failure(255, format!("disk '{}' does not exist", disk));
                };
                let mut parts: Vec<String> = current.split(',').map(str::to_string).collect();
                let have = parts
                    .iter()
                    .find_map(|p| p.strip_prefix("size=").and_then(DiskSize::parse));
                if have.is_some_and(|have| want < have) {
                    return failure(255, "shrinking disks is not supported");
                }
                parts.retain(|p| !p.starts_with("size="));
                parts.push(format!("size={}", want));
                res.config.insert(disk.clone(), parts.join(","));
                success("")
            }
            "start" => {
                if res.power == PowerState::Running {
                    return failure(255, format!("{} {} already running", kind, id));
                }
                res.power = PowerState::Running;
                success("")
            }
            "shutdown" | "stop" => {
                if res.power != PowerState::Running {
                    return failure(255, format!("{} {} not running", kind, id));
                }
                if !(sub == "shutdown" && self.ignore_shutdown.contains(&id)) {
                    res.power = PowerState::Stopped;
                }
                success("")
            }
            other => failure(255, format!("unknown command '{}'", other)),
        }
    }

    fn list(&self, kind: ResourceKind) -> CommandOutput {
        let mut out = match kind {
            ResourceKind::Container => "VMID       Status     Lock         Name\n".to_string(),
            ResourceKind::Vm => {
                "      VMID NAME                 STATUS     MEM(MB)    BOOTDISK(GB) PID\n"
                    .to_string()
            }
        };
        for (id, res) in self.resources.iter().filter(|(_, r)| r.kind == kind) {
            let name = res.get("hostname").or(res.get("name")).unwrap_or("-");
            out.push_str(&format!("{:>10} {:<10} {}\n", id, res.power, name));
        }
        success(out)
    }

    fn create(&mut self, kind: ResourceKind, id: u32, rest: &[String]) -> CommandOutput {
        if self.resources.contains_key(&id) {
            return failure(255, format!("unable to create {} {}: id already in use", kind, id));
        }
        if kind == ResourceKind::Container && rest.first().map_or(true, |a| a.starts_with("--")) {
            return failure(255, "missing ostemplate");
        }

        let mut config = BTreeMap::new();
        for (key, value) in options(rest) {
            match key.as_str() {
                "storage" if kind == ResourceKind::Container => {
                    config.insert("rootfs".to_string(), format!("{}:vm-{}-disk-0,size=8G", value, id));
                }
                "rootfs" | "scsi0" => {
                    config.insert(key, disk_volume(&value, id, 0));
                }
                _ => match stored_value(&key, value, id) {
                    Ok(value) => {
                        config.insert(key, value);
                    }
                    Err(out) => return out,
                },
            }
        }
        self.resources.insert(
            id,
            FakeResource {
                kind,
                power: PowerState::Stopped,
                config,
            },
        );
        success("")
    }

    fn clone_vm(&mut self, kind: ResourceKind, source: u32, rest: &[String]) -> CommandOutput {
        let Some(id) = rest.first().and_then(|a| a.parse::<u32>().ok()) else {
            return failure(255, "missing target vmid");
        };
        if kind != ResourceKind::Vm {
            return failure(255, "unknown command 'clone'");
        }
        let Some(src) = self.resources.get(&source).filter(|r| r.kind == kind) else {
            return failure(2, format!("Configuration file for vm {} does not exist", source));
        };
        if self.resources.contains_key(&id) {
            return failure(255, format!("unable to create vm {}: id already in use", id));
        }

        let opts = options(&rest[1..]);
        let storage = opts.iter().find(|(k, _)| k == "storage").map(|(_, v)| v.clone());
        let mut config = src.config.clone();
        for value in config.values_mut() {
            let old = format!("vm-{}-", source);
            if value.contains(&old) {
                *value = value.replace(&old, &format!("vm-{}-", id));
                if let (Some(store), Some((_, tail))) = (&storage, value.clone().split_once(':')) {
                    *value = format!("{}:{}", store, tail);
                }
            }
        }
        for (key, value) in opts {
            if key != "storage" && key != "full" {
                config.insert(key, value);
            }
        }
        self.resources.insert(
            id,
            FakeResource {
                kind,
                power: PowerState::Stopped,
                config,
            },
        );
        success("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(fake: &FakeHost, program: &str, args: &[&str]) -> CommandOutput {
        fake.run(&Invocation::new(program, args.iter().copied()), Duration::from_secs(1))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_list_and_status() {
        let fake = FakeHost::new()
            .with_container(101, PowerState::Running, &[("hostname", "dns")])
            .with_vm(200, PowerState::Stopped, &[("name", "web")]);

        let out = run(&fake, "pct", &["list"]).await;
        assert!(out.stdout.contains("101"));
        assert!(!out.stdout.contains("200"));
        assert_eq!(run(&fake, "qm", &["status", "200"]).await.stdout, "status: stopped\n");
        assert_eq!(run(&fake, "pct", &["status", "200"]).await.code, 2);
    }

    #[tokio::test]
    async fn test_set_and_power() {
        let fake = FakeHost::new().with_vm(200, PowerState::Running, &[("memory", "1024")]);
        run(&fake, "qm", &["shutdown", "200", "--timeout", "60"]).await;
        run(&fake, "qm", &["set", "200", "--memory", "2048", "--ide2", "local-lvm:cloudinit"]).await;
        run(&fake, "qm", &["start", "200"]).await;

        let res = fake.resource(200).unwrap();
        assert_eq!(res.power, PowerState::Running);
        assert_eq!(res.get("memory"), Some("2048"));
        assert_eq!(res.get("ide2"), Some("local-lvm:vm-200-cloudinit,media=cdrom"));
        assert_eq!(fake.mutating_calls().len(), 3);
        assert_eq!(fake.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_sshkeys_stored_encoded() {
        let dir = tempfile::TempDir::new().unwrap();
        let keys = dir.path().join("keys.pub");
        std::fs::write(&keys, "ssh-ed25519 AAAA ops@host\n").unwrap();
        let keys = keys.display().to_string();

        let fake = FakeHost::new().with_vm(200, PowerState::Stopped, &[]);
        run(&fake, "qm", &["set", "200", "--sshkeys", &keys]).await;
        assert_eq!(
            fake.resource(200).unwrap().get("sshkeys"),
            Some("ssh-ed25519%20AAAA%20ops%40host%0A")
        );
        assert_eq!(run(&fake, "qm", &["set", "200", "--sshkeys", "/nonexistent.pub"]).await.code, 255);

        run(&fake, "qm", &["create", "201", "--ide2", "local-lvm:cloudinit", "--sshkeys", &keys]).await;
        let created = fake.resource(201).unwrap();
        assert_eq!(created.get("ide2"), Some("local-lvm:vm-201-cloudinit,media=cdrom"));
        assert!(created.get("sshkeys").is_some());
    }

    #[tokio::test]
    async fn test_resize_refuses_shrink() {
        let fake = FakeHost::new().with_vm(200, PowerState::Stopped, &[("scsi0", "local-lvm:vm-200-disk-0,size=32G")]);
        assert_eq!(run(&fake, "qm", &["resize", "200", "scsi0", "16G"]).await.code, 255);
        assert_eq!(run(&fake, "qm", &["resize", "200", "scsi0", "64G"]).await.code, 0);
        assert_eq!(fake.resource(200).unwrap().disk_size(), Some(DiskSize::from_gib(64)));
    }

    #[tokio::test]
    async fn test_create_and_clone() {
        let fake = FakeHost::new().with_vm(
            9000,
            PowerState::Stopped,
            &[("name", "tmpl"), ("scsi0", "local-lvm:vm-9000-disk-0,size=10G")],
        );
        run(&fake, "qm", &["clone", "9000", "201", "--full", "1", "--name", "db", "--storage", "fast"]).await;
        let clone = fake.resource(201).unwrap();
        assert_eq!(clone.get("name"), Some("db"));
        assert_eq!(clone.get("scsi0"), Some("fast:vm-201-disk-0,size=10G"));

        run(&fake, "pct", &["create", "101", "local:vztmpl/debian.tar.zst", "--rootfs", "local-lvm:8"]).await;
        let ct = fake.resource(101).unwrap();
        assert_eq!(ct.kind, ResourceKind::Container);
        assert_eq!(ct.get("rootfs"), Some("local-lvm:vm-101-disk-0,size=8G"));
        assert_eq!(run(&fake, "pct", &["create", "101", "x"]).await.code, 255);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let fake = FakeHost::new()
            .with_container(101, PowerState::Running, &[])
            .fail_on("pct set 101")
            .time_out_on("pct stop");
        assert_eq!(run(&fake, "pct", &["set", "101", "--memory", "1"]).await.code, 255);
        let err = fake
            .run(&Invocation::new("pct", ["stop", "101"]), Duration::from_secs(3))
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::CommandTimeout { secs: 3, .. }));
        assert_eq!(fake.resource(101).unwrap().power, PowerState::Running);
    }
}
