//! One-shot operator chores: dependency install, log tail, cleanup and the
//! public address shown in login info.

use std::fs;
use std::io::{BufRead, BufReader, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::ManagerConfig;
use crate::error::{ManagerError, Result};
use crate::host::Host;
use crate::process::remove_pid_file;
use crate::supervisor::{ServiceSupervisor, StopOutcome};

/// Run the configured dependency install command.
///
/// The interpreter has to be present first, otherwise there is nothing to
/// install into.
pub fn install_dependencies(config: &ManagerConfig, host: &dyn Host) -> Result<String> {
    if let Some(interpreter) = config.interpreter() {
        if host.which(interpreter).is_none() {
            return Err(ManagerError::MissingDependency(interpreter.to_string()));
        }
    }

    let Some((program, args)) = config.deps.install.split_first() else {
        info!("no dependency install command configured");
        return Ok(String::new());
    };
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    info!(program = %program, "installing worker dependencies");
    let output = host.run(program, &args)?.check(program, &args)?;
    Ok(output.stdout)
}

/// Last `lines` lines of the worker log. No log yet means no lines.
pub fn tail_log(path: &Path, lines: usize) -> Result<Vec<String>> {
    let file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut tail = std::collections::VecDeque::with_capacity(lines);
    for line in BufReader::new(file).split(b'\n') {
        let line = String::from_utf8_lossy(&line?).trim_end_matches('\r').to_string();
        if tail.len() == lines {
            tail.pop_front();
        }
        if lines > 0 {
            tail.push_back(line);
        }
    }
    Ok(tail.into_iter().collect())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanReport {
    pub stopped: StopOutcome,
    pub removed: Vec<PathBuf>,
}

/// Stop the manual worker and delete its data directory, log and PID file.
/// The credential file and snapshots are kept.
pub fn clean(config: &ManagerConfig, supervisor: &ServiceSupervisor) -> Result<CleanReport> {
    let stopped = supervisor.stop()?;
    let mut removed = Vec::new();

    let data_dir = config.data_dir();
    if data_dir.exists() {
        fs::remove_dir_all(&data_dir)?;
        removed.push(data_dir);
    }

    let log = config.log_path();
    match fs::remove_file(&log) {
        Ok(()) => removed.push(log),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    remove_pid_file(&config.pid_path())?;

    info!(removed = removed.len(), "worker state cleaned");
    Ok(CleanReport { stopped, removed })
}

/// Look up this host's public address, trying each endpoint in turn.
/// Every failure degrades to `None`.
pub fn public_address(config: &ManagerConfig) -> Option<String> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(config.network.lookup_timeout_secs))
        .build()
        .ok()?;

    config.network.public_ip_endpoints.iter().find_map(|url| {
        let body = client
            .get(url)
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.text());
        match body {
            Ok(text) => parse_address(&text),
            Err(e) => {
                debug!(url = %url, error = %e, "public address lookup failed");
                None
            }
        }
    })
}

fn parse_address(body: &str) -> Option<String> {
    body.trim().parse::<std::net::IpAddr>().ok().map(|ip| ip.to_string())
}
