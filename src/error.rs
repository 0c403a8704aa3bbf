//! Error types for fwdctl.

use std::path::PathBuf;
use thiserror::Error;

/// Every failure the manager reports to the operator.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("required tool not found: {0}")]
    MissingDependency(String),

    #[error("permission denied: {0} (re-run with sudo)")]
    PermissionDenied(String),

    #[error("worker artifact not found: {}", .0.display())]
    ArtifactMissing(PathBuf),

    #[error("worker artifact failed validation: {0}")]
    ArtifactInvalid(String),

    #[error("no process with pid {0}")]
    ProcessNotFound(i32),

    #[error("stale pid file {}: {reason}", .path.display())]
    StaleReference { path: PathBuf, reason: String },

    #[error("config file not found: {}", .0.display())]
    ConfigMissing(PathBuf),

    #[error("invalid selection: {0}")]
    InvalidSelection(String),

    #[error("no transfer client available: {0}")]
    TransferClientUnavailable(String),

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("worker failed to start: {0}")]
    StartFailed(String),

    #[error("autostart registration not confirmed active: {0}")]
    AutostartVerificationFailed(String),

    #[error("`{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("invalid manager config: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ManagerError>;
