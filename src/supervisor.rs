//! Manual-mode start/stop/restart.
//!
//! These operations only ever touch the manual control plane (the PID file
//! and the process it names). A worker running under the service manager is
//! reported by `start()` as already running and is left alone by `stop()`;
//! use the autostart driver to control it.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::ManagerConfig;
use crate::error::{ManagerError, Result};
use crate::process::{remove_pid_file, ProcessHandle};
use crate::status::{ServiceRunState, StatusProbe};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started(i32),
    AlreadyRunning(ServiceRunState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    /// Exited within the grace period after SIGTERM.
    Terminated(i32),
    /// Needed SIGKILL.
    Killed(i32),
    /// The PID file named a process that was already gone.
    AlreadyExited(i32),
}

/// How the worker is launched in manual mode.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub interpreter: Option<String>,
    pub artifact: PathBuf,
    pub work_dir: PathBuf,
    pub log_file: PathBuf,
}

impl LaunchSpec {
    pub fn from_config(config: &ManagerConfig) -> Self {
        Self {
            interpreter: config.interpreter().map(str::to_string),
            artifact: config.artifact_path(),
            work_dir: config.base_dir.clone(),
            log_file: config.log_path(),
        }
    }

    fn command(&self) -> Command {
        match &self.interpreter {
            Some(interpreter) => {
                let mut cmd = Command::new(interpreter);
                cmd.arg(&self.artifact);
                cmd
            }
            None => Command::new(&self.artifact),
        }
    }

    fn program(&self) -> String {
        self.interpreter
            .clone()
            .unwrap_or_else(|| self.artifact.to_string_lossy().to_string())
    }
}

pub struct ServiceSupervisor {
    probe: StatusProbe,
    launch: LaunchSpec,
    settle: Duration,
    grace: Duration,
}

impl ServiceSupervisor {
    pub fn new(probe: StatusProbe, launch: LaunchSpec, settle: Duration, grace: Duration) -> Self {
        Self { probe, launch, settle, grace }
    }

    pub fn from_config(config: &ManagerConfig, probe: StatusProbe) -> Self {
        Self::new(
            probe,
            LaunchSpec::from_config(config),
            Duration::from_millis(config.supervisor.settle_ms),
            Duration::from_secs(config.supervisor.grace_secs),
        )
    }

    /// Fresh run state.
    pub fn status(&self) -> ServiceRunState {
        self.probe.probe()
    }

    pub fn probe(&self) -> &StatusProbe {
        &self.probe
    }

    fn pid_file(&self) -> &Path {
        self.probe.pid_file()
    }

    /// Launch the worker detached unless something is already running.
    pub fn start(&self) -> Result<StartOutcome> {
        let state = self.probe.probe();
        if state.is_running() {
            info!(%state, "worker already running");
            return Ok(StartOutcome::AlreadyRunning(state));
        }

        if !self.launch.artifact.exists() {
            return Err(ManagerError::ArtifactMissing(self.launch.artifact.clone()));
        }

        let log = open_log(&self.launch.log_file)?;
        let mut cmd = self.launch.command();
        cmd.current_dir(&self.launch.work_dir)
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log)
            .process_group(0);

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            ErrorKind::NotFound => ManagerError::MissingDependency(self.launch.program()),
            _ => ManagerError::Io(e),
        })?;
        let pid = child.id() as i32;
        let handle = match ProcessHandle::record(self.pid_file(), pid) {
            Ok(handle) => handle,
            Err(e) => {
                // Never leave a worker running without a pid record.
                warn!(pid, error = %e, "could not record worker pid, killing worker");
                if let Err(kill_err) = child.kill() {
                    debug!(pid, error = %kill_err, "worker already gone");
                }
                if let Err(wait_err) = child.wait() {
                    debug!(pid, error = %wait_err, "could not reap worker");
                }
                return Err(e);
            }
        };
        info!(pid, artifact = %self.launch.artifact.display(), "worker launched");

        // Reap the worker whenever it exits so a dead worker never lingers
        // as a zombie that answers signal 0.
        thread::spawn(move || {
            if let Ok(status) = child.wait() {
                debug!(pid, %status, "worker exited");
            }
        });

        thread::sleep(self.settle);

        match self.probe.probe() {
            ServiceRunState::Stopped => {
                handle.clear()?;
                Err(ManagerError::StartFailed(format!(
                    "pid {} exited within {} ms, see {}",
                    pid,
                    self.settle.as_millis(),
                    self.launch.log_file.display()
                )))
            }
            ServiceRunState::RunningManual(live) if live == pid => Ok(StartOutcome::Started(pid)),
            other => {
                warn!(pid, state = %other, "unexpected state after launch");
                Ok(StartOutcome::Started(pid))
            }
        }
    }

    /// SIGTERM, wait out the grace period, SIGKILL if needed. The PID file
    /// is removed whichever path was taken.
    pub fn stop(&self) -> Result<StopOutcome> {
        let handle = match ProcessHandle::load(self.pid_file()) {
            Ok(Some(handle)) => handle,
            Ok(None) => {
                debug!("no pid file, nothing to stop");
                return Ok(StopOutcome::NotRunning);
            }
            Err(e @ ManagerError::StaleReference { .. }) => {
                info!(error = %e, "discarding unreadable pid file");
                remove_pid_file(self.pid_file())?;
                return Ok(StopOutcome::NotRunning);
            }
            Err(e) => return Err(e),
        };

        let outcome = self.shut_down(&handle);
        handle.clear()?;
        let outcome = outcome?;
        info!(pid = handle.pid, ?outcome, "worker stopped");
        Ok(outcome)
    }

    /// `stop()` then `start()`, strictly in that order.
    pub fn restart(&self) -> Result<(StopOutcome, StartOutcome)> {
        let stopped = self.stop()?;
        let started = self.start()?;
        Ok((stopped, started))
    }

    fn shut_down(&self, handle: &ProcessHandle) -> Result<StopOutcome> {
        match handle.terminate() {
            Ok(()) => {}
            Err(ManagerError::ProcessNotFound(pid)) => return Ok(StopOutcome::AlreadyExited(pid)),
            Err(e) => return Err(e),
        }

        let deadline = Instant::now() + self.grace;
        while Instant::now() < deadline {
            if !handle.is_alive() {
                return Ok(StopOutcome::Terminated(handle.pid));
            }
            thread::sleep(POLL_INTERVAL);
        }

        warn!(
            pid = handle.pid,
            grace_secs = self.grace.as_secs(),
            "worker ignored SIGTERM, killing"
        );
        match handle.kill() {
            Ok(()) | Err(ManagerError::ProcessNotFound(_)) => Ok(StopOutcome::Killed(handle.pid)),
            Err(e) => Err(e),
        }
    }
}

fn open_log(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}
