//! User-level launch agent (launchd).
//!
//! The agent runs a small wrapper script that changes into the worker's
//! directory and execs the worker, so the plist never has to know about
//! the interpreter.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::{quote, AutostartRegistration, RemoveOutcome};
use crate::config::ManagerConfig;
use crate::error::{ManagerError, Result};
use crate::host::Host;

const LAUNCHCTL: &str = "launchctl";

pub struct LaunchAgentDriver {
    label: String,
    agents_dir: PathBuf,
    wrapper: PathBuf,
    work_dir: PathBuf,
    interpreter: Option<String>,
    artifact: PathBuf,
    log_file: PathBuf,
    host: Arc<dyn Host>,
}

impl LaunchAgentDriver {
    /// Fails when no agents directory is configured and `$HOME` is unknown.
    pub fn from_config(config: &ManagerConfig, host: Arc<dyn Host>) -> Result<Self> {
        let agents_dir = match &config.autostart.launch_agents_dir {
            Some(dir) => dir.clone(),
            None => host
                .home_dir()
                .map(|home| home.join("Library").join("LaunchAgents"))
                .ok_or_else(|| {
                    ManagerError::InvalidConfig(
                        "cannot locate ~/Library/LaunchAgents: HOME is not set".to_string(),
                    )
                })?,
        };

        Ok(Self {
            label: config.autostart.launch_agent_label.clone(),
            agents_dir,
            wrapper: config.launch_wrapper_path(),
            work_dir: config.base_dir.clone(),
            interpreter: config.interpreter().map(str::to_string),
            artifact: config.artifact_path(),
            log_file: config.log_path(),
            host,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn plist_path(&self) -> PathBuf {
        self.agents_dir.join(format!("{}.plist", self.label))
    }

    /// Write wrapper and plist, load the agent, confirm it is running.
    pub fn install(&self) -> Result<AutostartRegistration> {
        if self.host.which(LAUNCHCTL).is_none() {
            return Err(ManagerError::MissingDependency(LAUNCHCTL.to_string()));
        }

        let wrapper = self.render_wrapper()?;
        fs::write(&self.wrapper, wrapper)?;
        fs::set_permissions(&self.wrapper, fs::Permissions::from_mode(0o755))?;

        let plist = self.plist_path();
        fs::create_dir_all(&self.agents_dir)?;
        fs::write(&plist, self.render_plist())?;
        info!(path = %plist.display(), "wrote launch agent");

        let plist_arg = plist.to_string_lossy().to_string();
        // A previous load must be dropped first or launchd keeps the old definition.
        if let Ok(out) = self.host.run(LAUNCHCTL, &["unload", &plist_arg]) {
            debug!(success = out.success, "unloaded previous agent");
        }
        let args = ["load", "-w", plist_arg.as_str()];
        self.host.run(LAUNCHCTL, &args)?.check(LAUNCHCTL, &args)?;

        if !self.is_active() {
            return Err(ManagerError::AutostartVerificationFailed(format!(
                "agent {} is loaded but not running",
                self.label
            )));
        }

        info!(label = %self.label, "launch agent active");
        Ok(AutostartRegistration::LaunchAgent { plist_path: plist, label: self.label.clone() })
    }

    /// Unload and delete the agent. No plist is a no-op.
    pub fn remove(&self) -> Result<RemoveOutcome> {
        let plist = self.plist_path();
        if !plist.exists() {
            info!(path = %plist.display(), "no launch agent installed");
            return Ok(RemoveOutcome::NotInstalled);
        }

        let plist_arg = plist.to_string_lossy().to_string();
        match self.host.run(LAUNCHCTL, &["unload", "-w", &plist_arg]) {
            Ok(out) if !out.success => debug!(stderr = %out.stderr.trim(), "agent was not loaded"),
            Ok(_) => {}
            Err(e) => return Err(e),
        }
        fs::remove_file(&plist)?;
        if let Err(e) = fs::remove_file(&self.wrapper) {
            debug!(error = %e, "launch wrapper already gone");
        }

        info!(label = %self.label, "launch agent removed");
        Ok(RemoveOutcome::Removed)
    }

    /// `launchctl list <label>` only prints a PID for a running job.
    pub fn is_active(&self) -> bool {
        match self.host.run(LAUNCHCTL, &["list", &self.label]) {
            Ok(out) => out.success && out.stdout.contains("\"PID\""),
            Err(_) => false,
        }
    }

    pub fn registration(&self) -> AutostartRegistration {
        let plist = self.plist_path();
        if plist.exists() {
            AutostartRegistration::LaunchAgent { plist_path: plist, label: self.label.clone() }
        } else {
            AutostartRegistration::Unregistered
        }
    }

    pub fn restart(&self) -> Result<()> {
        let plist_arg = self.plist_path().to_string_lossy().to_string();
        let unload = ["unload", plist_arg.as_str()];
        self.host.run(LAUNCHCTL, &unload)?.check(LAUNCHCTL, &unload)?;
        let load = ["load", plist_arg.as_str()];
        self.host.run(LAUNCHCTL, &load)?.check(LAUNCHCTL, &load)?;
        Ok(())
    }

    fn render_wrapper(&self) -> Result<String> {
        let exec = match &self.interpreter {
            Some(interpreter) => {
                let resolved = self
                    .host
                    .which(interpreter)
                    .ok_or_else(|| ManagerError::MissingDependency(interpreter.clone()))?;
                format!(
                    "{} {}",
                    quote(&resolved.to_string_lossy()),
                    quote(&self.artifact.to_string_lossy())
                )
            }
            None => quote(&self.artifact.to_string_lossy()),
        };
        Ok(format!(
            "#!/bin/sh\ncd {} || exit 1\nexec {}\n",
            quote(&self.work_dir.to_string_lossy()),
            exec
        ))
    }

    fn render_plist(&self) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>{label}</string>
    <key>ProgramArguments</key>
    <array>
        <string>{wrapper}</string>
    </array>
    <key>WorkingDirectory</key>
    <string>{work_dir}</string>
    <key>RunAtLoad</key>
    <true/>
    <key>KeepAlive</key>
    <true/>
    <key>StandardOutPath</key>
    <string>{log}</string>
    <key>StandardErrorPath</key>
    <string>{log}</string>
</dict>
</plist>
"#,
            label = xml_escape(&self.label),
            wrapper = xml_path(&self.wrapper),
            work_dir = xml_path(&self.work_dir),
            log = xml_path(&self.log_file),
        )
    }
}

fn xml_path(path: &Path) -> String {
    xml_escape(&path.to_string_lossy())
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::fake::FakeHost;
    use tempfile::tempdir;

    fn driver(base: &Path, host: Arc<FakeHost>) -> LaunchAgentDriver {
        let config = ManagerConfig::with_base_dir(base);
        LaunchAgentDriver::from_config(&config, host).unwrap()
    }

    fn home_host(home: &Path) -> FakeHost {
        FakeHost { home: Some(home.to_path_buf()), ..Default::default() }
    }

    #[test]
    fn test_install_writes_plist_and_wrapper() {
        let base = tempdir().unwrap();
        let home = tempdir().unwrap();
        let host = Arc::new(home_host(home.path()));
        let d = driver(base.path(), host.clone());

        let reg = d.install().unwrap();
        let plist_path = home
            .path()
            .join("Library/LaunchAgents/com.portforwarder.worker.plist");
        assert_eq!(
            reg,
            AutostartRegistration::LaunchAgent {
                plist_path: plist_path.clone(),
                label: "com.portforwarder.worker".to_string(),
            }
        );

        let plist = fs::read_to_string(&plist_path).unwrap();
        assert!(plist.contains("<key>RunAtLoad</key>\n    <true/>"));
        assert!(plist.contains("<key>KeepAlive</key>\n    <true/>"));
        assert!(plist.contains(&base.path().join("launch_worker.sh").display().to_string()));
        assert!(plist.contains(&base.path().join("port_forwarder.log").display().to_string()));

        let wrapper = fs::read_to_string(base.path().join("launch_worker.sh")).unwrap();
        assert!(wrapper.starts_with("#!/bin/sh\n"));
        assert!(wrapper.contains("exec /usr/bin/python3"));
        let mode = fs::metadata(base.path().join("launch_worker.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);

        assert!(host.calls().iter().any(|c| c.starts_with("launchctl load -w")));
        assert!(d.is_active());
    }

    #[test]
    fn test_install_unverified() {
        let base = tempdir().unwrap();
        let home = tempdir().unwrap();
        let host = Arc::new(FakeHost { stay_inactive: true, ..home_host(home.path()) });
        let d = driver(base.path(), host);

        assert!(matches!(d.install(), Err(ManagerError::AutostartVerificationFailed(_))));
    }

    #[test]
    fn test_remove_when_absent_is_noop() {
        let base = tempdir().unwrap();
        let home = tempdir().unwrap();
        let host = Arc::new(home_host(home.path()));
        let d = driver(base.path(), host.clone());

        assert_eq!(d.remove().unwrap(), RemoveOutcome::NotInstalled);
        assert!(host.calls().is_empty());
    }

    #[test]
    fn test_remove_unloads_and_deletes() {
        let base = tempdir().unwrap();
        let home = tempdir().unwrap();
        let host = Arc::new(home_host(home.path()));
        let d = driver(base.path(), host.clone());

        d.install().unwrap();
        assert_eq!(d.remove().unwrap(), RemoveOutcome::Removed);
        assert!(!d.plist_path().exists());
        assert!(!base.path().join("launch_worker.sh").exists());
        assert_eq!(d.registration(), AutostartRegistration::Unregistered);
        assert!(!d.is_active());
    }

    #[test]
    fn test_missing_home_without_override() {
        let config = ManagerConfig::with_base_dir(Path::new("/srv/fwd"));
        let result = LaunchAgentDriver::from_config(&config, Arc::new(FakeHost::default()));
        assert!(matches!(result, Err(ManagerError::InvalidConfig(_))));
    }

    #[test]
    fn test_xml_escape() {
        assert_eq!(xml_escape("a&b<c>"), "a&amp;b&lt;c&gt;");
    }
}
