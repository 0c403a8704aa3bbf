//! PID-file backed reference to a manually launched worker.
//!
//! The PID file is the only durable record of a manual launch. Its content
//! is never trusted without a liveness probe.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{ManagerError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: i32,
    pub pid_file: PathBuf,
}

impl ProcessHandle {
    /// Write `pid` to `pid_file`, replacing any previous record.
    pub fn record(pid_file: &Path, pid: i32) -> Result<Self> {
        if let Some(parent) = pid_file.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(pid_file, format!("{}\n", pid))?;
        info!(pid, path = %pid_file.display(), "recorded worker pid");
        Ok(Self { pid, pid_file: pid_file.to_path_buf() })
    }

    /// Read the PID file. `None` when there is no file; `StaleReference`
    /// when its content is not a usable pid.
    pub fn load(pid_file: &Path) -> Result<Option<Self>> {
        let text = match fs::read_to_string(pid_file) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match text.trim().parse::<i32>() {
            Ok(pid) if pid > 0 => Ok(Some(Self { pid, pid_file: pid_file.to_path_buf() })),
            _ => Err(ManagerError::StaleReference {
                path: pid_file.to_path_buf(),
                reason: format!("unparseable pid {:?}", text.trim()),
            }),
        }
    }

    pub fn is_alive(&self) -> bool {
        is_alive(self.pid)
    }

    /// Ask the worker to exit (SIGTERM).
    pub fn terminate(&self) -> Result<()> {
        signal(self.pid, libc::SIGTERM)
    }

    /// Force the worker down (SIGKILL).
    pub fn kill(&self) -> Result<()> {
        signal(self.pid, libc::SIGKILL)
    }

    /// Remove the PID file. Already gone is fine.
    pub fn clear(&self) -> Result<()> {
        remove_pid_file(&self.pid_file)
    }
}

/// Remove a PID file, tolerating its absence.
pub fn remove_pid_file(pid_file: &Path) -> Result<()> {
    match fs::remove_file(pid_file) {
        Ok(()) => {
            debug!(path = %pid_file.display(), "removed pid file");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Check whether a process exists (signal 0). A process owned by another
/// user still counts as alive.
pub fn is_alive(pid: i32) -> bool {
    // kill(0) and kill(-1) address process groups, never a single worker.
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn signal(pid: i32, sig: libc::c_int) -> Result<()> {
    if pid <= 0 {
        return Err(ManagerError::ProcessNotFound(pid));
    }
    // SAFETY: pid is positive so this targets exactly one process.
    let rc = unsafe { libc::kill(pid, sig) };
    if rc == 0 {
        debug!(pid, signal = sig, "signal delivered");
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Err(ManagerError::ProcessNotFound(pid)),
        Some(libc::EPERM) => Err(ManagerError::PermissionDenied(format!(
            "signal pid {} owned by another user",
            pid
        ))),
        _ => Err(err.into()),
    }
}
