//! Exclusive ownership of a WAL root directory
//!
//! The `LOCK` file carries an advisory `flock` and the holder's pid. The
//! kernel drops a flock when its process exits, so a held flock always means
//! a live holder; leftover content from a crashed holder is simply
//! overwritten by the next one.

use crate::types::unix_time_ms;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";

/// Process that owns a WAL directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub acquired_at_ms: u64,
}

impl LockHolder {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            acquired_at_ms: unix_time_ms(),
        }
    }

    pub fn is_alive(&self) -> bool {
        process_exists(self.pid)
    }
}

/// Exclusive lock on a WAL root, held for the lifetime of a `WalManager`
///
/// Opening the same root twice fails, whether from another process or from
/// a second manager in this one. The lock file is removed on drop.
#[derive(Debug)]
pub struct WalDirLock {
    path: PathBuf,
    _file: File,
    holder: LockHolder,
}

impl WalDirLock {
    /// Lock `wal_root`, creating the directory if needed
    pub fn acquire(wal_root: &Path) -> Result<Self> {
        std::fs::create_dir_all(wal_root)
            .with_context(|| format!("Failed to create WAL directory {}", wal_root.display()))?;
        let path = wal_root.join(LOCK_FILE);

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;

        if !try_flock_exclusive(&file)? {
            // The holder may not have written its pid yet
            let pid = read_holder(&mut file)
                .map_or_else(|_| "unknown".to_string(), |h| h.pid.to_string());
            anyhow::bail!(
                "WAL directory {} is locked by process {}",
                wal_root.display(),
                pid
            );
        }

        if let Ok(previous) = read_holder(&mut file) {
            if previous.pid != std::process::id() && !previous.is_alive() {
                tracing::warn!(
                    "Taking over WAL lock left by exited process {}",
                    previous.pid
                );
            }
        }

        let holder = LockHolder::current();
        write_holder(&mut file, &holder)?;
        tracing::debug!("Locked WAL directory {} (pid {})", wal_root.display(), holder.pid);

        Ok(Self {
            path,
            _file: file,
            holder,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn holder(&self) -> LockHolder {
        self.holder
    }
}

impl Drop for WalDirLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn write_holder(file: &mut File, holder: &LockHolder) -> Result<()> {
    let json = serde_json::to_vec(holder).context("Failed to encode lock holder")?;
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&json)?;
    file.sync_all()?;
    Ok(())
}

fn read_holder(file: &mut File) -> Result<LockHolder> {
    let mut buf = Vec::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut buf)?;
    serde_json::from_slice(&buf).context("Lock file has no valid holder")
}

#[cfg(unix)]
fn try_flock_exclusive(file: &File) -> Result<bool> {
    use nix::fcntl::{flock, FlockArg};
    use std::os::unix::io::AsRawFd;

    match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
        Ok(()) => Ok(true),
        Err(nix::errno::Errno::EWOULDBLOCK) => Ok(false),
        Err(e) => Err(e).context("flock failed"),
    }
}

#[cfg(not(unix))]
fn try_flock_exclusive(_file: &File) -> Result<bool> {
    Ok(true)
}

#[cfg(target_os = "linux")]
fn process_exists(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(all(unix, not(target_os = "linux")))]
fn process_exists(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // Null signal only checks existence
    !matches!(
        kill(Pid::from_raw(pid as i32), None),
        Err(nix::errno::Errno::ESRCH)
    )
}

#[cfg(not(unix))]
fn process_exists(_pid: u32) -> bool {
    true
}
