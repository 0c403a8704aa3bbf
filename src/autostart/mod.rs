//! Autostart: persistent OS-native registrations for the worker.
//!
//! Two platform variants, chosen at runtime from the host OS:
//!
//! ```text
//! ┌───────────────────────────┐   ┌────────────────────────────────┐
//! │ LaunchAgentDriver (macOS) │   │ SystemUnitDriver (Linux)       │
//! │  ~/Library/LaunchAgents/  │   │  /etc/systemd/system/*.service │
//! │  launchctl load/unload    │   │  systemctl enable/disable      │
//! └───────────────────────────┘   └────────────────────────────────┘
//! ```
//!
//! The registration is OS-managed state; nothing here is cached.

pub mod launch_agent;
pub mod system_unit;

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::ManagerConfig;
use crate::error::{ManagerError, Result};
use crate::host::Host;

pub use launch_agent::LaunchAgentDriver;
pub use system_unit::SystemUnitDriver;

/// What is registered with the host's service manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutostartRegistration {
    LaunchAgent { plist_path: PathBuf, label: String },
    SystemUnit { unit_file_path: PathBuf, unit_name: String, run_as_user: String },
    Unregistered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    NotInstalled,
}

/// Installs and removes the worker's autostart registration.
pub enum AutostartDriver {
    LaunchAgent(LaunchAgentDriver),
    SystemUnit(SystemUnitDriver),
}

impl AutostartDriver {
    /// Pick the driver for the running OS.
    pub fn for_host(config: &ManagerConfig, host: Arc<dyn Host>) -> Result<Self> {
        match env::consts::OS {
            "macos" => Ok(Self::LaunchAgent(LaunchAgentDriver::from_config(config, host)?)),
            "linux" => Ok(Self::SystemUnit(SystemUnitDriver::from_config(config, host))),
            other => Err(ManagerError::UnsupportedPlatform(other.to_string())),
        }
    }

    pub fn install(&self) -> Result<AutostartRegistration> {
        match self {
            Self::LaunchAgent(d) => d.install(),
            Self::SystemUnit(d) => d.install(),
        }
    }

    pub fn remove(&self) -> Result<RemoveOutcome> {
        match self {
            Self::LaunchAgent(d) => d.remove(),
            Self::SystemUnit(d) => d.remove(),
        }
    }

    /// Whether the service manager reports the worker as running.
    /// A host without the service-manager tool reports `false`.
    pub fn is_active(&self) -> bool {
        match self {
            Self::LaunchAgent(d) => d.is_active(),
            Self::SystemUnit(d) => d.is_active(),
        }
    }

    /// The registration currently on disk.
    pub fn registration(&self) -> AutostartRegistration {
        match self {
            Self::LaunchAgent(d) => d.registration(),
            Self::SystemUnit(d) => d.registration(),
        }
    }

    /// Restart the worker through the service manager.
    pub fn restart(&self) -> Result<()> {
        match self {
            Self::LaunchAgent(d) => d.restart(),
            Self::SystemUnit(d) => d.restart(),
        }
    }

    /// Name the service manager knows the worker by.
    pub fn service_name(&self) -> &str {
        match self {
            Self::LaunchAgent(d) => d.label(),
            Self::SystemUnit(d) => d.unit_name(),
        }
    }
}

/// Quote a path for a shell script or unit `ExecStart=` line.
pub(crate) fn quote(s: &str) -> String {
    if !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || "/._-+:@".contains(c)) {
        s.to_string()
    } else {
        format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
    }
}
