//! Wiring: one `Manager` per base directory, built from `ManagerConfig`.

use std::sync::Arc;
use tracing::info;

use crate::autostart::AutostartDriver;
use crate::backup::BackupManager;
use crate::config::ManagerConfig;
use crate::credentials::{ConfigStore, LoginInfo};
use crate::error::Result;
use crate::host::Host;
use crate::maintenance;
use crate::status::{ServiceRunState, StatusProbe};
use crate::supervisor::ServiceSupervisor;
use crate::updater::{ControlPlane, Updater};

pub struct Manager {
    pub config: ManagerConfig,
    pub host: Arc<dyn Host>,
    pub supervisor: ServiceSupervisor,
    pub credentials: ConfigStore,
    pub backups: BackupManager,
    pub updater: Updater,
}

impl Manager {
    pub fn open(config: ManagerConfig, host: Arc<dyn Host>) -> Result<Self> {
        let driver = AutostartDriver::for_host(&config, Arc::clone(&host))?;
        let updater = Updater::from_config(&config, Arc::clone(&host));
        Ok(Self::with_parts(config, host, driver, updater))
    }

    /// Assemble with an explicit driver and updater.
    pub fn with_parts(
        config: ManagerConfig,
        host: Arc<dyn Host>,
        driver: AutostartDriver,
        updater: Updater,
    ) -> Self {
        let probe = StatusProbe::new(driver, config.pid_path());
        let supervisor = ServiceSupervisor::from_config(&config, probe);
        let credentials = ConfigStore::new(config.credentials_path());
        let backups = BackupManager::from_config(&config);
        info!(base_dir = %config.base_dir.display(), "manager ready");
        Self { config, host, supervisor, credentials, backups, updater }
    }

    pub fn status(&self) -> ServiceRunState {
        self.supervisor.status()
    }

    pub fn probe(&self) -> &StatusProbe {
        self.supervisor.probe()
    }

    pub fn autostart(&self) -> &AutostartDriver {
        self.supervisor.probe().driver()
    }

    /// Restart through the plane the updater offered.
    pub fn restart_via(&self, plane: &ControlPlane) -> Result<()> {
        match plane {
            ControlPlane::ServiceManager(_) => self.autostart().restart(),
            ControlPlane::Manual => self.supervisor.restart().map(|_| ()),
        }
    }

    /// The plane a restart should go through right now, if anything runs.
    pub fn active_plane(&self) -> Option<ControlPlane> {
        match self.status() {
            ServiceRunState::Stopped => None,
            ServiceRunState::RunningUnderServiceManager(name) => {
                Some(ControlPlane::ServiceManager(name))
            }
            ServiceRunState::RunningManual(_) => Some(ControlPlane::Manual),
        }
    }

    /// Login details with the public address, or `localhost` when unknown.
    pub fn login_info(&self, public_address: Option<&str>) -> Result<Option<LoginInfo>> {
        let creds = self.credentials.read()?;
        let host = public_address.unwrap_or("localhost");
        Ok(LoginInfo::from_config(&creds, host, self.config.worker.web_port))
    }

    pub fn public_address(&self) -> Option<String> {
        maintenance::public_address(&self.config)
    }
}
