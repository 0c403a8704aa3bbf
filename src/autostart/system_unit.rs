//! System-level service unit (systemd).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use super::{quote, AutostartRegistration, RemoveOutcome};
use crate::config::ManagerConfig;
use crate::error::{ManagerError, Result};
use crate::host::Host;

const SYSTEMCTL: &str = "systemctl";

pub struct SystemUnitDriver {
    unit_name: String,
    unit_dir: PathBuf,
    work_dir: PathBuf,
    interpreter: Option<String>,
    artifact: PathBuf,
    log_file: PathBuf,
    run_as: Option<String>,
    restart_sec: u32,
    host: Arc<dyn Host>,
}

impl SystemUnitDriver {
    pub fn from_config(config: &ManagerConfig, host: Arc<dyn Host>) -> Self {
        Self {
            unit_name: config.autostart.unit_name.clone(),
            unit_dir: config.autostart.unit_dir.clone(),
            work_dir: config.base_dir.clone(),
            interpreter: config.interpreter().map(str::to_string),
            artifact: config.artifact_path(),
            log_file: config.log_path(),
            run_as: config.autostart.run_as.clone(),
            restart_sec: config.autostart.restart_sec,
            host,
        }
    }

    pub fn unit_name(&self) -> &str {
        &self.unit_name
    }

    pub fn unit_file_path(&self) -> PathBuf {
        self.unit_dir.join(format!("{}.service", self.unit_name))
    }

    /// Write the unit, reload, enable-and-start, then confirm it is active.
    ///
    /// Re-running overwrites the unit and re-enables it.
    pub fn install(&self) -> Result<AutostartRegistration> {
        if !self.host.is_elevated() {
            return Err(ManagerError::PermissionDenied(format!(
                "installing {}",
                self.unit_file_path().display()
            )));
        }
        if self.host.which(SYSTEMCTL).is_none() {
            return Err(ManagerError::MissingDependency(SYSTEMCTL.to_string()));
        }

        let user = self
            .run_as
            .clone()
            .or_else(|| self.host.session_user())
            .unwrap_or_else(|| "root".to_string());
        let exec_start = self.exec_start()?;
        let unit = self.render_unit(&user, &exec_start);

        let path = self.unit_file_path();
        fs::create_dir_all(&self.unit_dir)?;
        fs::write(&path, unit)?;
        info!(path = %path.display(), user = %user, "wrote service unit");

        self.systemctl(&["daemon-reload"])?;
        self.systemctl(&["enable", "--now", &self.unit_name])?;

        if !self.is_active() {
            return Err(ManagerError::AutostartVerificationFailed(format!(
                "unit {} is not active after enable --now",
                self.unit_name
            )));
        }

        info!(unit = %self.unit_name, "service unit active");
        Ok(AutostartRegistration::SystemUnit {
            unit_file_path: path,
            unit_name: self.unit_name.clone(),
            run_as_user: user,
        })
    }

    /// Disable-and-stop, delete the unit, reload. No unit file is a no-op.
    pub fn remove(&self) -> Result<RemoveOutcome> {
        let path = self.unit_file_path();
        if !path.exists() {
            info!(path = %path.display(), "no service unit installed");
            return Ok(RemoveOutcome::NotInstalled);
        }
        if !self.host.is_elevated() {
            return Err(ManagerError::PermissionDenied(format!(
                "removing {}",
                path.display()
            )));
        }

        if let Err(e) = self.systemctl(&["disable", "--now", &self.unit_name]) {
            warn!(error = %e, unit = %self.unit_name, "disable failed, removing unit anyway");
        }
        fs::remove_file(&path)?;
        self.systemctl(&["daemon-reload"])?;

        info!(unit = %self.unit_name, "service unit removed");
        Ok(RemoveOutcome::Removed)
    }

    pub fn is_active(&self) -> bool {
        match self.host.run(SYSTEMCTL, &["is-active", "--quiet", &self.unit_name]) {
            Ok(out) => out.success,
            Err(_) => false,
        }
    }

    pub fn registration(&self) -> AutostartRegistration {
        let path = self.unit_file_path();
        let Ok(text) = fs::read_to_string(&path) else {
            return AutostartRegistration::Unregistered;
        };
        let run_as_user = text
            .lines()
            .find_map(|l| l.strip_prefix("User="))
            .unwrap_or("root")
            .to_string();
        AutostartRegistration::SystemUnit {
            unit_file_path: path,
            unit_name: self.unit_name.clone(),
            run_as_user,
        }
    }

    pub fn restart(&self) -> Result<()> {
        self.systemctl(&["restart", &self.unit_name])
    }

    fn exec_start(&self) -> Result<String> {
        let artifact = quote(&self.artifact.to_string_lossy());
        match &self.interpreter {
            Some(interpreter) => {
                let resolved = self
                    .host
                    .which(interpreter)
                    .ok_or_else(|| ManagerError::MissingDependency(interpreter.clone()))?;
                Ok(format!("{} {}", quote(&resolved.to_string_lossy()), artifact))
            }
            None => Ok(artifact),
        }
    }

    fn render_unit(&self, user: &str, exec_start: &str) -> String {
        format!(
            "[Unit]
Description=Port forwarder worker
After=network-online.target
Wants=network-online.target

[Service]
Type=simple
User={user}
WorkingDirectory={work_dir}
ExecStart={exec_start}
Restart=always
RestartSec={restart_sec}
StandardOutput=append:{log}
StandardError=append:{log}

[Install]
WantedBy=multi-user.target
",
            user = user,
            work_dir = display(&self.work_dir),
            exec_start = exec_start,
            restart_sec = self.restart_sec,
            log = display(&self.log_file),
        )
    }

    fn systemctl(&self, args: &[&str]) -> Result<()> {
        self.host.run(SYSTEMCTL, args)?.check(SYSTEMCTL, args)?;
        Ok(())
    }
}

fn display(path: &Path) -> String {
    path.to_string_lossy().to_string()
}
