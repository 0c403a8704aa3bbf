//! Manager configuration: where the worker lives and how it is supervised.
//!
//! Loaded from an optional `fwdctl.toml` in the base directory. Every field
//! has a default matching the stock worker layout, so a missing file is not
//! an error. Relative paths resolve against the base directory.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{ManagerError, Result};

/// Config file looked up in the base directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "fwdctl.toml";

/// Placeholder substituted with the artifact path in the validator command.
pub const ARTIFACT_PLACEHOLDER: &str = "{artifact}";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Directory the worker runs in; filled in by `load`, never read from TOML.
    #[serde(skip)]
    pub base_dir: PathBuf,
    pub worker: WorkerSection,
    pub supervisor: SupervisorSection,
    pub autostart: AutostartSection,
    pub backup: BackupSection,
    pub update: UpdateSection,
    pub deps: DepsSection,
    pub network: NetworkSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub artifact: PathBuf,
    /// Program the artifact is handed to. Empty means the artifact is executed directly.
    pub interpreter: String,
    pub log_file: PathBuf,
    pub credentials_file: PathBuf,
    pub data_dir: PathBuf,
    pub pid_file: PathBuf,
    pub web_port: u16,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            artifact: PathBuf::from("t.py"),
            interpreter: "python3".to_string(),
            log_file: PathBuf::from("port_forwarder.log"),
            credentials_file: PathBuf::from("password.txt"),
            data_dir: PathBuf::from("data"),
            pid_file: PathBuf::from("/tmp/port_forwarder.pid"),
            web_port: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    /// Delay between launching the worker and confirming it is alive.
    pub settle_ms: u64,
    /// How long a SIGTERM'd worker gets before SIGKILL.
    pub grace_secs: u64,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self { settle_ms: 2000, grace_secs: 5 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AutostartSection {
    pub unit_name: String,
    pub unit_dir: PathBuf,
    /// Identity the system unit runs as. Falls back to the session user.
    pub run_as: Option<String>,
    pub restart_sec: u32,
    pub launch_agent_label: String,
    /// Per-user agents directory. Defaults to `~/Library/LaunchAgents`.
    pub launch_agents_dir: Option<PathBuf>,
    pub launch_wrapper: PathBuf,
}

impl Default for AutostartSection {
    fn default() -> Self {
        Self {
            unit_name: "port-forwarder".to_string(),
            unit_dir: PathBuf::from("/etc/systemd/system"),
            run_as: None,
            restart_sec: 10,
            launch_agent_label: "com.portforwarder.worker".to_string(),
            launch_agents_dir: None,
            launch_wrapper: PathBuf::from("launch_worker.sh"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackupSection {
    pub dir: PathBuf,
}

impl Default for BackupSection {
    fn default() -> Self {
        Self { dir: PathBuf::from("backups") }
    }
}

/// Which control plane restarts the worker after an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartVia {
    /// Whichever plane the worker was running under.
    #[default]
    Active,
    ServiceManager,
    Manual,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpdateSection {
    pub url: Option<String>,
    pub timeout_secs: u64,
    pub validator: Vec<String>,
    pub restart_via: RestartVia,
}

impl Default for UpdateSection {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: 60,
            validator: ["python3", "-m", "py_compile", ARTIFACT_PLACEHOLDER]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            restart_via: RestartVia::Active,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DepsSection {
    pub install: Vec<String>,
}

impl Default for DepsSection {
    fn default() -> Self {
        Self {
            install: ["python3", "-m", "pip", "install", "--user", "flask"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    pub public_ip_endpoints: Vec<String>,
    pub lookup_timeout_secs: u64,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            public_ip_endpoints: vec![
                "http://ip.42.pl/raw".to_string(),
                "http://ifconfig.me".to_string(),
            ],
            lookup_timeout_secs: 5,
        }
    }
}

impl ManagerConfig {
    /// Load the config for `base_dir`.
    ///
    /// An explicit `path` must exist; the default `fwdctl.toml` is optional.
    pub fn load(base_dir: &Path, path: Option<&Path>) -> Result<Self> {
        let (file, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (base_dir.join(DEFAULT_CONFIG_FILE), false),
        };

        let mut config = if file.exists() {
            info!(path = %file.display(), "loading manager config");
            let text = fs::read_to_string(&file)?;
            Self::parse(&text)?
        } else if required {
            return Err(ManagerError::ConfigMissing(file));
        } else {
            debug!(path = %file.display(), "no manager config, using defaults");
            Self::default()
        };

        config.base_dir = base_dir.to_path_buf();
        Ok(config)
    }

    /// Parse TOML text. `base_dir` is left empty.
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| ManagerError::InvalidConfig(e.to_string()))
    }

    /// Defaults rooted at `base_dir`.
    pub fn with_base_dir(base_dir: &Path) -> Self {
        Self { base_dir: base_dir.to_path_buf(), ..Self::default() }
    }

    /// Resolve a configured path against the base directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn artifact_path(&self) -> PathBuf {
        self.resolve(&self.worker.artifact)
    }

    pub fn log_path(&self) -> PathBuf {
        self.resolve(&self.worker.log_file)
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.resolve(&self.worker.credentials_file)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.resolve(&self.worker.data_dir)
    }

    pub fn pid_path(&self) -> PathBuf {
        self.resolve(&self.worker.pid_file)
    }

    pub fn backup_root(&self) -> PathBuf {
        self.resolve(&self.backup.dir)
    }

    pub fn launch_wrapper_path(&self) -> PathBuf {
        self.resolve(&self.autostart.launch_wrapper)
    }

    /// Interpreter, or `None` when the artifact is executed directly.
    pub fn interpreter(&self) -> Option<&str> {
        let trimmed = self.worker.interpreter.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_match_worker_layout() {
        let config = ManagerConfig::with_base_dir(Path::new("/srv/fwd"));
        assert_eq!(config.artifact_path(), PathBuf::from("/srv/fwd/t.py"));
        assert_eq!(config.credentials_path(), PathBuf::from("/srv/fwd/password.txt"));
        assert_eq!(config.log_path(), PathBuf::from("/srv/fwd/port_forwarder.log"));
        assert_eq!(config.pid_path(), PathBuf::from("/tmp/port_forwarder.pid"));
        assert_eq!(config.backup_root(), PathBuf::from("/srv/fwd/backups"));
        assert_eq!(config.interpreter(), Some("python3"));
        assert_eq!(config.update.restart_via, RestartVia::Active);
        assert!(config.update.url.is_none());
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let config = ManagerConfig::parse(
            r#"
[worker]
interpreter = ""
pid_file = "run/worker.pid"

[update]
url = "https://example.com/t.py"
restart_via = "service-manager"
"#,
        )
        .unwrap();

        assert_eq!(config.interpreter(), None);
        assert_eq!(config.worker.artifact, PathBuf::from("t.py"));
        assert_eq!(config.worker.pid_file, PathBuf::from("run/worker.pid"));
        assert_eq!(config.update.restart_via, RestartVia::ServiceManager);
        assert_eq!(config.supervisor.grace_secs, 5);
    }

    #[test]
    fn test_malformed_toml_is_invalid_config() {
        let result = ManagerConfig::parse("[worker\nartifact = ");
        assert!(matches!(result, Err(ManagerError::InvalidConfig(_))));
    }

    #[test]
    fn test_load_missing_default_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = ManagerConfig::load(dir.path(), None).unwrap();
        assert_eq!(config.base_dir, dir.path());
        assert_eq!(config.artifact_path(), dir.path().join("t.py"));
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let result = ManagerConfig::load(dir.path(), Some(&missing));
        assert!(matches!(result, Err(ManagerError::ConfigMissing(_))));
    }

    #[test]
    fn test_load_reads_default_file() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(DEFAULT_CONFIG_FILE),
            "[backup]\ndir = \"/var/backups/fwd\"\n",
        )
        .unwrap();
        let config = ManagerConfig::load(dir.path(), None).unwrap();
        assert_eq!(config.backup_root(), PathBuf::from("/var/backups/fwd"));
    }
}
