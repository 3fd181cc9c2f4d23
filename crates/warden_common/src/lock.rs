//! Host-wide execution lock
//!
//! Ensures only one reconciliation run executes at a time using:
//! - An advisory `flock` on the lock file, held for the whole run
//! - PID, run id and timestamp written into the file for diagnostics
//! - Bounded wait: poll until the holder releases or the bound elapses
//!
//! The kernel drops the `flock` when the holder exits, so a killed run never
//! leaves the host permanently unreconcilable. A live holder is never broken.

use crate::error::{Result, WardenError};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::process;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Poll interval while waiting for the lock
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Lock file contents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Process ID holding the lock
    pub pid: u32,
    /// Unix epoch seconds when the lock was taken
    pub acquired_at: u64,
    /// Hostname for debugging
    pub hostname: String,
    /// Run id of the holder
    pub run_id: String,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl LockInfo {
    fn new(run_id: &str) -> Self {
        let hostname = fs::read_to_string("/etc/hostname")
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            pid: process::id(),
            acquired_at: now_secs(),
            hostname,
            run_id: run_id.to_string(),
        }
    }

    /// Holder whose file is empty or mid-write
    fn unknown() -> Self {
        Self {
            pid: 0,
            acquired_at: now_secs(),
            hostname: "unknown".to_string(),
            run_id: "unknown".to_string(),
        }
    }

    pub fn age_secs(&self) -> u64 {
        now_secs().saturating_sub(self.acquired_at)
    }

    fn is_stale(&self, stale_after: Duration) -> bool {
        self.age_secs() > stale_after.as_secs()
    }
}

enum Attempt {
    Acquired(ExecutionLock),
    Held(LockInfo),
}

/// Same inode on the same device
fn same_file(file: &File, path: &Path) -> bool {
    match (file.metadata(), fs::metadata(path)) {
        (Ok(open), Ok(named)) => open.dev() == named.dev() && open.ino() == named.ino(),
        _ => false,
    }
}

/// Execution lock handle - released on drop
pub struct ExecutionLock {
    path: PathBuf,
    info: LockInfo,
    file: Flock<File>,
}

impl fmt::Debug for ExecutionLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionLock")
            .field("path", &self.path)
            .field("info", &self.info)
            .finish()
    }
}

impl ExecutionLock {
    /// Acquire the lock, waiting up to `wait` for a live holder to release it.
    pub async fn acquire(
        path: &Path,
        wait: Duration,
        stale_after: Duration,
        run_id: &str,
    ) -> Result<Self> {
        let started = Instant::now();
        loop {
            match Self::attempt(path, stale_after, run_id)? {
                Attempt::Acquired(lock) => return Ok(lock),
                Attempt::Held(holder) => {
                    let waited = started.elapsed();
                    if waited >= wait {
                        return Err(WardenError::LockContention {
                            path: path.display().to_string(),
                            holder_pid: holder.pid,
                            waited_secs: waited.as_secs(),
                        });
                    }
                    debug!(
                        "Lock {} held by PID {} (run {}), waiting",
                        path.display(),
                        holder.pid,
                        holder.run_id
                    );
                    let remaining = wait.saturating_sub(waited);
                    tokio::time::sleep(POLL_INTERVAL.min(remaining)).await;
                }
            }
        }
    }

    /// Single non-blocking attempt
    pub fn try_acquire(path: &Path, stale_after: Duration, run_id: &str) -> Result<Self> {
        match Self::attempt(path, stale_after, run_id)? {
            Attempt::Acquired(lock) => Ok(lock),
            Attempt::Held(holder) => Err(WardenError::LockContention {
                path: path.display().to_string(),
                holder_pid: holder.pid,
                waited_secs: 0,
            }),
        }
    }

    fn attempt(path: &Path, stale_after: Duration, run_id: &str) -> Result<Attempt> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    WardenError::Lock(format!("cannot create {}: {}", parent.display(), e))
                })?;
            }
        }

        loop {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)
                .map_err(|e| WardenError::Lock(format!("cannot open {}: {}", path.display(), e)))?;

            let mut locked = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(locked) => locked,
                Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                    let holder = Self::read_holder(path);
                    if holder.is_stale(stale_after) {
                        warn!(
                            "Lock {} held by PID {} for {}s, past the stale bound",
                            path.display(),
                            holder.pid,
                            holder.age_secs()
                        );
                    }
                    return Ok(Attempt::Held(holder));
                }
                Err((_, errno)) => {
                    return Err(WardenError::Lock(format!(
                        "cannot lock {}: {}",
                        path.display(),
                        errno
                    )))
                }
            };

            // The previous holder unlinks the file before unlocking it
            if !same_file(&locked, path) {
                debug!("Lock {} was replaced while locking, retrying", path.display());
                continue;
            }

            let file: &mut File = &mut locked;
            let mut previous = String::new();
            file.read_to_string(&mut previous)?;
            if !previous.trim().is_empty() {
                match serde_json::from_str::<LockInfo>(&previous) {
                    Ok(holder) => warn!(
                        "Recovering lock {} left by PID {} (run {}, age {}s)",
                        path.display(),
                        holder.pid,
                        holder.run_id,
                        holder.age_secs()
                    ),
                    Err(e) => warn!("Recovering corrupted lock {}: {}", path.display(), e),
                }
            }

            let info = LockInfo::new(run_id);
            let content = serde_json::to_string_pretty(&info)
                .map_err(|e| WardenError::Lock(e.to_string()))?;
            file.set_len(0)?;
            file.rewind()?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;

            info!("Execution lock acquired: {} (pid={})", path.display(), info.pid);
            return Ok(Attempt::Acquired(Self {
                path: path.to_path_buf(),
                info,
                file: locked,
            }));
        }
    }

    fn read_holder(path: &Path) -> LockInfo {
        fs::read_to_string(path)
            .ok()
            .and_then(|c| serde_json::from_str::<LockInfo>(&c).ok())
            .unwrap_or_else(LockInfo::unknown)
    }

    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check the lock path is still our locked file and still names this run
    pub fn is_valid(&self) -> bool {
        same_file(&self.file, &self.path)
            && fs::read_to_string(&self.path)
                .ok()
                .and_then(|c| serde_json::from_str::<LockInfo>(&c).ok())
                .is_some_and(|info| info.pid == self.info.pid && info.run_id == self.info.run_id)
    }
}

impl Drop for ExecutionLock {
    fn drop(&mut self) {
        // Unlink while still holding the flock; it is released with `file`
        if self.is_valid() {
            match fs::remove_file(&self.path) {
                Ok(()) => info!("Execution lock released: {}", self.path.display()),
                Err(e) => warn!("Failed to release lock {}: {}", self.path.display(), e),
            }
        }
    }
}
