//! # fwdctl
//!
//! Lifecycle manager for a single long-running port forwarder worker.
//!
//! fwdctl starts, stops and supervises the worker, registers it for
//! autostart with the host's service manager, edits its credential file,
//! snapshots and restores its state, and updates the worker artifact with
//! rollback.
//!
//! ## Key Features
//!
//! - **Two control planes**: manual (PID file) and managed (systemd/launchd),
//!   reconciled fresh on every query
//! - **Safe updates**: rename-aside, download, validate, roll back on failure
//! - **Snapshots**: data directory, credentials and log, restorable by number
//! - **Surgical config edits**: only the touched lines change
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fwdctl::{Manager, ManagerConfig, SystemHost};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! let config = ManagerConfig::load(Path::new("/srv/forwarder"), None)?;
//! let manager = Manager::open(config, Arc::new(SystemHost))?;
//!
//! manager.supervisor.start()?;
//! println!("worker is {}", manager.status());
//! # Ok::<(), fwdctl::ManagerError>(())
//! ```

pub mod autostart;
pub mod backup;
pub mod config;
pub mod credentials;
pub mod error;
pub mod host;
pub mod maintenance;
pub mod manager;
pub mod process;
pub mod status;
pub mod supervisor;
pub mod updater;

// Re-exports for convenience
pub use error::{ManagerError, Result};

pub use autostart::{
    AutostartDriver, AutostartRegistration, LaunchAgentDriver, RemoveOutcome, SystemUnitDriver,
};
pub use backup::{BackupManager, BackupSnapshot, RestoreReport};
pub use config::{ManagerConfig, RestartVia};
pub use credentials::{ConfigStore, CredentialConfig, LoginInfo, MutationOutcome};
pub use host::{CommandOutput, Host, SystemHost};
pub use manager::Manager;
pub use process::ProcessHandle;
pub use status::{ServiceRunState, StatusProbe};
pub use supervisor::{LaunchSpec, ServiceSupervisor, StartOutcome, StopOutcome};
pub use updater::{ControlPlane, Fetcher, HttpFetcher, UpdateOutcome, Updater};

/// Token an operator must type to confirm a destructive operation.
pub const CONFIRM_TOKEN: &str = "CONFIRM";

/// Exact, case-sensitive match against `CONFIRM_TOKEN` (surrounding
/// whitespace from line input is ignored).
pub fn confirmed(input: &str) -> bool {
    input.trim() == CONFIRM_TOKEN
}
