//! Run-state reconciliation across the two control planes.
//!
//! `probe()` re-derives the truth from the OS on every call and keeps no
//! memory between calls. The service manager wins over the PID file.

use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::autostart::AutostartDriver;
use crate::error::ManagerError;
use crate::process::{remove_pid_file, ProcessHandle};

/// How the worker is running right now. Derived, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceRunState {
    Stopped,
    RunningUnderServiceManager(String),
    RunningManual(i32),
}

impl ServiceRunState {
    pub fn is_running(&self) -> bool {
        !matches!(self, Self::Stopped)
    }
}

impl fmt::Display for ServiceRunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::RunningUnderServiceManager(name) => {
                write!(f, "running under service manager ({})", name)
            }
            Self::RunningManual(pid) => write!(f, "running manually (pid {})", pid),
        }
    }
}

pub struct StatusProbe {
    driver: AutostartDriver,
    pid_file: PathBuf,
}

impl StatusProbe {
    pub fn new(driver: AutostartDriver, pid_file: PathBuf) -> Self {
        Self { driver, pid_file }
    }

    /// Determine the run state. First match wins:
    ///
    /// 1. service manager reports the registration active
    /// 2. PID file names a live process (a dead or garbled one is deleted)
    /// 3. stopped
    pub fn probe(&self) -> ServiceRunState {
        if self.driver.is_active() {
            let name = self.driver.service_name().to_string();
            debug!(service = %name, "service manager reports worker active");
            return ServiceRunState::RunningUnderServiceManager(name);
        }

        match ProcessHandle::load(&self.pid_file) {
            Ok(Some(handle)) if handle.is_alive() => {
                debug!(pid = handle.pid, "manual worker alive");
                return ServiceRunState::RunningManual(handle.pid);
            }
            Ok(Some(handle)) => {
                info!(pid = handle.pid, path = %self.pid_file.display(), "removing stale pid file");
                self.discard_pid_file();
            }
            Ok(None) => {}
            Err(e @ ManagerError::StaleReference { .. }) => {
                info!(error = %e, "removing stale pid file");
                self.discard_pid_file();
            }
            Err(e) => warn!(error = %e, "could not read pid file"),
        }

        ServiceRunState::Stopped
    }

    pub fn driver(&self) -> &AutostartDriver {
        &self.driver
    }

    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    fn discard_pid_file(&self) {
        if let Err(e) = remove_pid_file(&self.pid_file) {
            warn!(error = %e, path = %self.pid_file.display(), "could not remove stale pid file");
        }
    }
}
