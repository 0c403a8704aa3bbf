//! Worker updater: fetches the latest worker artifact and swaps it in.
//!
//! The previous artifact is renamed (never copied) to a timestamped backup
//! before the download lands on the canonical name. Any failure renames the
//! backup straight back, so the canonical path always holds either the old
//! artifact or a validated new one.

use chrono::Utc;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{ManagerConfig, RestartVia, ARTIFACT_PLACEHOLDER};
use crate::error::{ManagerError, Result};
use crate::host::Host;
use crate::status::{ServiceRunState, StatusProbe};

/// Capability to fetch a URL into a file.
pub trait Fetcher {
    fn fetch(&self, url: &str, dest: &Path) -> Result<()>;
}

/// HTTP(S) fetcher over a blocking reqwest client.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("fwdctl/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| ManagerError::TransferClientUnavailable(e.to_string()))?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| ManagerError::DownloadFailed(format!("{}: {}", url, e)))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(ManagerError::DownloadFailed(format!("{}: HTTP {}", url, status)));
        }

        let bytes = response
            .bytes()
            .map_err(|e| ManagerError::DownloadFailed(format!("{}: {}", url, e)))?;
        fs::write(dest, &bytes)?;
        Ok(())
    }
}

/// Which control plane should restart the freshly updated worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPlane {
    ServiceManager(String),
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// Previous artifact, kept as an audit trail. `None` on a first install.
    pub backup: Option<PathBuf>,
    /// Set when the worker was running; the operator decides whether to act.
    pub restart_offer: Option<ControlPlane>,
}

pub struct Updater {
    fetcher: Option<Box<dyn Fetcher>>,
    url: Option<String>,
    artifact: PathBuf,
    validator: Vec<String>,
    restart_via: RestartVia,
    host: Arc<dyn Host>,
}

impl Updater {
    pub fn new(
        fetcher: Option<Box<dyn Fetcher>>,
        url: Option<String>,
        artifact: PathBuf,
        validator: Vec<String>,
        restart_via: RestartVia,
        host: Arc<dyn Host>,
    ) -> Self {
        Self { fetcher, url, artifact, validator, restart_via, host }
    }

    /// Build with the HTTP fetcher. A client that fails to build leaves the
    /// updater without a transfer capability; `run()` reports that.
    pub fn from_config(config: &ManagerConfig, host: Arc<dyn Host>) -> Self {
        let fetcher = match HttpFetcher::new(Duration::from_secs(config.update.timeout_secs)) {
            Ok(f) => Some(Box::new(f) as Box<dyn Fetcher>),
            Err(e) => {
                warn!(error = %e, "HTTP client unavailable");
                None
            }
        };
        Self::new(
            fetcher,
            config.update.url.clone(),
            config.artifact_path(),
            config.update.validator.clone(),
            config.update.restart_via,
            host,
        )
    }

    pub fn artifact(&self) -> &Path {
        &self.artifact
    }

    /// Download, validate, and swap in the new artifact.
    pub fn run(&self, probe: &StatusProbe) -> Result<UpdateOutcome> {
        let fetcher = self.fetcher.as_ref().ok_or_else(|| {
            ManagerError::TransferClientUnavailable("no HTTP client could be built".to_string())
        })?;
        let url = self.url.as_deref().map(str::trim).filter(|u| !u.is_empty()).ok_or_else(|| {
            ManagerError::InvalidConfig(
                "no update source: set `url` under [update] in fwdctl.toml".to_string(),
            )
        })?;
        if !url.starts_with("https://") {
            return Err(ManagerError::InvalidConfig(format!(
                "update url must use https: {}",
                url
            )));
        }

        let state = probe.probe();
        let backup = self.set_aside()?;
        let permissions = backup
            .as_ref()
            .and_then(|b| fs::metadata(b).ok())
            .map(|m| m.permissions());

        info!(url, artifact = %self.artifact.display(), "downloading worker artifact");
        if let Err(e) = fetcher.fetch(url, &self.artifact) {
            self.roll_back(backup.as_deref());
            return Err(match e {
                e @ ManagerError::DownloadFailed(_) => e,
                other => ManagerError::DownloadFailed(other.to_string()),
            });
        }

        if let Err(e) = self.validate() {
            self.roll_back(backup.as_deref());
            return Err(e);
        }

        if let Some(permissions) = permissions {
            fs::set_permissions(&self.artifact, permissions)?;
        }

        info!(backup = ?backup, "worker artifact updated");
        let restart_offer = self.restart_plane(&state, probe.driver().service_name());
        Ok(UpdateOutcome { backup, restart_offer })
    }

    /// Rename the current artifact to `<name>.bak.<timestamp>`.
    fn set_aside(&self) -> Result<Option<PathBuf>> {
        if !self.artifact.exists() {
            info!(artifact = %self.artifact.display(), "no previous artifact to back up");
            return Ok(None);
        }

        let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let file_name = self.artifact.file_name().unwrap_or_default().to_string_lossy().to_string();
        let mut backup = self.artifact.with_file_name(format!("{}.bak.{}", file_name, stamp));
        let mut n = 1;
        while backup.exists() {
            backup = self.artifact.with_file_name(format!("{}.bak.{}_{}", file_name, stamp, n));
            n += 1;
        }

        fs::rename(&self.artifact, &backup)?;
        info!(backup = %backup.display(), "previous artifact set aside");
        Ok(Some(backup))
    }

    /// Put the previous artifact back on the canonical name.
    fn roll_back(&self, backup: Option<&Path>) {
        match fs::remove_file(&self.artifact) {
            Ok(()) => info!(artifact = %self.artifact.display(), "discarded failed download"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, "could not remove failed download"),
        }
        if let Some(backup) = backup {
            match fs::rename(backup, &self.artifact) {
                Ok(()) => info!(artifact = %self.artifact.display(), "previous artifact restored"),
                Err(e) => warn!(
                    error = %e,
                    backup = %backup.display(),
                    "could not restore previous artifact, it remains at the backup path"
                ),
            }
        }
    }

    /// Static check of the downloaded artifact. An empty validator passes.
    fn validate(&self) -> Result<()> {
        let Some((program, rest)) = self.validator.split_first() else {
            return Ok(());
        };
        let artifact = self.artifact.to_string_lossy();
        let args: Vec<String> = rest
            .iter()
            .map(|arg| arg.replace(ARTIFACT_PLACEHOLDER, &artifact))
            .collect();
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

        let output = self.host.run(program, &arg_refs)?;
        if output.success {
            Ok(())
        } else {
            let detail =
                if output.stderr.trim().is_empty() { output.stdout } else { output.stderr };
            Err(ManagerError::ArtifactInvalid(detail.trim().to_string()))
        }
    }

    fn restart_plane(&self, state: &ServiceRunState, service_name: &str) -> Option<ControlPlane> {
        if !state.is_running() {
            return None;
        }
        let plane = match (self.restart_via, state) {
            (RestartVia::Manual, _) => ControlPlane::Manual,
            (RestartVia::ServiceManager, _) => {
                ControlPlane::ServiceManager(service_name.to_string())
            }
            (RestartVia::Active, ServiceRunState::RunningUnderServiceManager(name)) => {
                ControlPlane::ServiceManager(name.clone())
            }
            (RestartVia::Active, _) => ControlPlane::Manual,
        };
        Some(plane)
    }
}
