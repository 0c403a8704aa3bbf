//! Snapshots of the worker's data directory, credential file and log.
//!
//! Each snapshot is a self-contained `backup_<timestamp>` directory under
//! the backup root. Nothing here ever deletes a snapshot.

use chrono::Utc;
use std::ffi::OsStr;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::ManagerConfig;
use crate::error::{ManagerError, Result};
use crate::supervisor::{ServiceSupervisor, StopOutcome};

const SNAPSHOT_PREFIX: &str = "backup_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSnapshot {
    /// Sortable UTC creation stamp, e.g. `20261018_142501_337`.
    pub timestamp: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub snapshot: BackupSnapshot,
    pub stopped: StopOutcome,
    pub restored: Vec<PathBuf>,
    /// Live paths left alone because the snapshot does not contain them.
    pub skipped: Vec<PathBuf>,
}

/// The three live items a snapshot covers.
#[derive(Debug, Clone)]
pub struct BackupSources {
    pub data_dir: PathBuf,
    pub config_file: PathBuf,
    pub log_file: PathBuf,
}

impl BackupSources {
    fn items(&self) -> [(&Path, &'static str); 3] {
        [
            (self.data_dir.as_path(), "data"),
            (self.config_file.as_path(), "password.txt"),
            (self.log_file.as_path(), "port_forwarder.log"),
        ]
    }
}

/// Name an item has inside a snapshot: the live file name.
fn entry_name<'a>(live: &'a Path, fallback: &'a str) -> &'a OsStr {
    live.file_name().unwrap_or_else(|| OsStr::new(fallback))
}

pub struct BackupManager {
    root: PathBuf,
    sources: BackupSources,
}

impl BackupManager {
    pub fn new(root: PathBuf, sources: BackupSources) -> Self {
        Self { root, sources }
    }

    pub fn from_config(config: &ManagerConfig) -> Self {
        Self::new(
            config.backup_root(),
            BackupSources {
                data_dir: config.data_dir(),
                config_file: config.credentials_path(),
                log_file: config.log_path(),
            },
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Copy whatever of the three sources exists into a new snapshot.
    pub fn create(&self) -> Result<BackupSnapshot> {
        let snapshot = self.allocate()?;

        for (live, fallback) in self.sources.items() {
            if !live.exists() {
                debug!(path = %live.display(), "backup source absent, skipping");
                continue;
            }
            let dest = snapshot.path.join(entry_name(live, fallback));
            copy_item(live, &dest)?;
        }

        info!(path = %snapshot.path.display(), "snapshot created");
        Ok(snapshot)
    }

    /// Snapshots in creation order. No backup root means no snapshots.
    pub fn list(&self) -> Result<Vec<BackupSnapshot>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut snapshots = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(timestamp) = name.strip_prefix(SNAPSHOT_PREFIX) {
                snapshots.push(BackupSnapshot {
                    timestamp: timestamp.to_string(),
                    path: entry.path(),
                });
            }
        }
        snapshots.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(snapshots)
    }

    /// Resolve a 1-based `selection` against [`list`](Self::list).
    pub fn select(&self, selection: &str) -> Result<BackupSnapshot> {
        let mut snapshots = self.list()?;
        let index: usize = selection.trim().parse().map_err(|_| {
            ManagerError::InvalidSelection(format!("{:?} is not a backup number", selection.trim()))
        })?;
        if index == 0 || index > snapshots.len() {
            return Err(ManagerError::InvalidSelection(format!(
                "backup {} does not exist ({} available)",
                index,
                snapshots.len()
            )));
        }
        Ok(snapshots.swap_remove(index - 1))
    }

    /// Restore the snapshot at 1-based `selection` over the live files.
    ///
    /// The manual worker is stopped first and not restarted afterwards.
    pub fn restore(
        &self,
        selection: &str,
        supervisor: &ServiceSupervisor,
    ) -> Result<RestoreReport> {
        let snapshot = self.select(selection)?;

        let stopped = supervisor.stop()?;
        info!(?stopped, snapshot = %snapshot.path.display(), "worker stopped for restore");

        let mut restored = Vec::new();
        let mut skipped = Vec::new();
        for (live, fallback) in self.sources.items() {
            let src = snapshot.path.join(entry_name(live, fallback));
            if !src.exists() {
                debug!(path = %src.display(), "not in snapshot, leaving live copy");
                skipped.push(live.to_path_buf());
                continue;
            }
            if src.is_dir() && live.exists() {
                fs::remove_dir_all(live)?;
            }
            copy_item(&src, live)?;
            restored.push(live.to_path_buf());
        }

        info!(restored = restored.len(), skipped = skipped.len(), "restore complete");
        Ok(RestoreReport { snapshot, stopped, restored, skipped })
    }

    fn allocate(&self) -> Result<BackupSnapshot> {
        fs::create_dir_all(&self.root)?;
        // UTC keeps names in creation order across DST changes.
        let stamp = Utc::now().format("%Y%m%d_%H%M%S_%3f").to_string();

        for n in 0..100u32 {
            let timestamp = if n == 0 { stamp.clone() } else { format!("{}_{:02}", stamp, n) };
            let path = self.root.join(format!("{}{}", SNAPSHOT_PREFIX, timestamp));
            match fs::create_dir(&path) {
                Ok(()) => return Ok(BackupSnapshot { timestamp, path }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(ManagerError::Io(std::io::Error::new(
            ErrorKind::AlreadyExists,
            format!("no free snapshot name for {}", stamp),
        )))
    }
}

/// Copy a file or a whole directory, keeping permissions and mtimes.
pub(crate) fn copy_item(src: &Path, dest: &Path) -> Result<()> {
    if src.is_dir() {
        copy_tree(src, dest)
    } else {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        copy_file(src, dest)
    }
}

fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    let mut dirs = Vec::new();
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|e| {
            ManagerError::Io(e.into_io_error().unwrap_or_else(|| {
                std::io::Error::new(ErrorKind::Other, "filesystem loop while copying")
            }))
        })?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dest.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            dirs.push((entry.path().to_path_buf(), target));
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            if fs::symlink_metadata(&target).is_ok() {
                fs::remove_file(&target)?;
            }
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            copy_file(entry.path(), &target)?;
        }
    }

    // Directory metadata last, after their contents stop changing.
    for (src_dir, target) in dirs.into_iter().rev() {
        let meta = fs::metadata(&src_dir)?;
        fs::set_permissions(&target, meta.permissions())?;
        if let Ok(modified) = meta.modified() {
            let result = fs::File::open(&target).and_then(|dir| dir.set_modified(modified));
            if let Err(e) = result {
                debug!(path = %target.display(), error = %e, "directory mtime not preserved");
            }
        }
    }
    Ok(())
}

fn copy_file(src: &Path, dest: &Path) -> Result<()> {
    fs::copy(src, dest)?;
    let modified = fs::metadata(src)?.modified()?;
    // Read-only copies cannot be reopened for writing; they keep the copy time.
    match fs::File::options().write(true).open(dest) {
        Ok(file) => file.set_modified(modified)?,
        Err(e) => debug!(path = %dest.display(), error = %e, "mtime not preserved"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autostart::{AutostartDriver, SystemUnitDriver};
    use crate::host::fake::FakeHost;
    use crate::process::ProcessHandle;
    use crate::status::StatusProbe;
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};
    use tempfile::{tempdir, TempDir};

    fn setup(dir: &TempDir) -> (ManagerConfig, BackupManager, ServiceSupervisor) {
        let mut config = ManagerConfig::with_base_dir(dir.path());
        config.worker.interpreter = "sh".to_string();
        config.worker.artifact = PathBuf::from("worker.sh");
        config.worker.pid_file = PathBuf::from("worker.pid");
        config.autostart.unit_dir = dir.path().join("units");
        config.supervisor.settle_ms = 300;
        config.supervisor.grace_secs = 2;
        let driver = AutostartDriver::SystemUnit(SystemUnitDriver::from_config(
            &config,
            Arc::new(FakeHost::default()),
        ));
        let probe = StatusProbe::new(driver, config.pid_path());
        let supervisor = ServiceSupervisor::from_config(&config, probe);
        (config.clone(), BackupManager::from_config(&config), supervisor)
    }

    fn write_live(config: &ManagerConfig, tag: &str) {
        fs::create_dir_all(config.data_dir().join("nested")).unwrap();
        let forwards = format!("{{\"tag\":\"{}\"}}", tag);
        fs::write(config.data_dir().join("forwards.json"), forwards).unwrap();
        fs::write(config.data_dir().join("nested").join("stats.json"), tag).unwrap();
        fs::write(config.credentials_path(), format!("password={}\npath=p\n", tag)).unwrap();
        fs::write(config.log_path(), format!("log {}\n", tag)).unwrap();
    }

    #[test]
    fn test_list_without_root_is_empty() {
        let dir = tempdir().unwrap();
        let (_, backups, _) = setup(&dir);
        assert!(backups.list().unwrap().is_empty());
    }

    #[test]
    fn test_create_copies_all_sources() {
        let dir = tempdir().unwrap();
        let (config, backups, _) = setup(&dir);
        write_live(&config, "one");
        let old = SystemTime::now() - Duration::from_secs(3600);
        fs::File::options()
            .write(true)
            .open(config.log_path())
            .unwrap()
            .set_modified(old)
            .unwrap();

        let snap = backups.create().unwrap();
        assert!(snap.path.starts_with(backups.root()));
        assert_eq!(
            fs::read_to_string(snap.path.join("data/nested/stats.json")).unwrap(),
            "one"
        );
        assert_eq!(
            fs::read_to_string(snap.path.join("password.txt")).unwrap(),
            "password=one\npath=p\n"
        );
        let copied_mtime = fs::metadata(snap.path.join("port_forwarder.log"))
            .unwrap()
            .modified()
            .unwrap();
        assert_eq!(copied_mtime, old);
    }

    #[test]
    fn test_create_partial_backup_is_valid() {
        let dir = tempdir().unwrap();
        let (config, backups, _) = setup(&dir);
        fs::write(config.credentials_path(), "password=x\n").unwrap();

        let snap = backups.create().unwrap();
        assert!(snap.path.join("password.txt").exists());
        assert!(!snap.path.join("data").exists());
        assert!(!snap.path.join("port_forwarder.log").exists());
    }

    #[test]
    fn test_sequential_snapshots_are_listed_in_order() {
        let dir = tempdir().unwrap();
        let (config, backups, _) = setup(&dir);
        write_live(&config, "x");

        let created: Vec<_> = (0..3).map(|_| backups.create().unwrap()).collect();
        assert_eq!(backups.list().unwrap(), created);
    }

    #[test]
    fn test_snapshot_stamp_is_utc() {
        let dir = tempdir().unwrap();
        let (_, backups, _) = setup(&dir);

        let snap = backups.create().unwrap();
        let stamped =
            chrono::NaiveDateTime::parse_from_str(&snap.timestamp[..15], "%Y%m%d_%H%M%S").unwrap();
        let drift = Utc::now().naive_utc() - stamped;
        assert!(drift.num_seconds().abs() < 60, "stamp {} drifted {}", snap.timestamp, drift);
    }

    #[test]
    fn test_select_resolves_listed_order() {
        let dir = tempdir().unwrap();
        let (config, backups, _) = setup(&dir);
        write_live(&config, "a");
        let first = backups.create().unwrap();
        let second = backups.create().unwrap();

        assert_eq!(backups.select("1").unwrap(), first);
        assert_eq!(backups.select(" 2\n").unwrap(), second);
        for bad in ["0", "3", "x"] {
            assert!(matches!(backups.select(bad), Err(ManagerError::InvalidSelection(_))));
        }
    }

    #[test]
    fn test_restore_rejects_bad_selection_without_touching_files() {
        let dir = tempdir().unwrap();
        let (config, backups, supervisor) = setup(&dir);
        write_live(&config, "snap");
        backups.create().unwrap();
        write_live(&config, "live");
        ProcessHandle::record(&config.pid_path(), std::process::id() as i32).unwrap();

        for bad in ["0", "2", "-1", "abc", ""] {
            let result = backups.restore(bad, &supervisor);
            assert!(
                matches!(result, Err(ManagerError::InvalidSelection(_))),
                "selection {:?}",
                bad
            );
        }
        assert_eq!(fs::read_to_string(config.log_path()).unwrap(), "log live\n");
        assert!(config.pid_path().exists(), "invalid selection must not stop the worker");
    }

    #[test]
    fn test_restore_replaces_live_state() {
        let dir = tempdir().unwrap();
        let (config, backups, supervisor) = setup(&dir);
        write_live(&config, "first");
        backups.create().unwrap();
        write_live(&config, "second");
        fs::write(config.data_dir().join("added_later.json"), "{}").unwrap();
        backups.create().unwrap();
        write_live(&config, "third");

        let report = backups.restore("1", &supervisor).unwrap();
        assert_eq!(report.stopped, StopOutcome::NotRunning);
        assert_eq!(report.restored.len(), 3);
        assert!(report.skipped.is_empty());

        assert_eq!(fs::read_to_string(config.log_path()).unwrap(), "log first\n");
        assert_eq!(
            fs::read_to_string(config.credentials_path()).unwrap(),
            "password=first\npath=p\n"
        );
        assert_eq!(
            fs::read_to_string(config.data_dir().join("nested/stats.json")).unwrap(),
            "first"
        );
        assert!(!config.data_dir().join("added_later.json").exists());
    }

    #[test]
    fn test_restore_skips_items_missing_from_snapshot() {
        let dir = tempdir().unwrap();
        let (config, backups, supervisor) = setup(&dir);
        fs::write(config.credentials_path(), "password=old\n").unwrap();
        backups.create().unwrap();
        write_live(&config, "live");

        let report = backups.restore(" 1 ", &supervisor).unwrap();
        assert_eq!(report.restored, vec![config.credentials_path()]);
        assert_eq!(report.skipped, vec![config.data_dir(), config.log_path()]);
        assert_eq!(fs::read_to_string(config.log_path()).unwrap(), "log live\n");
        assert_eq!(fs::read_to_string(config.credentials_path()).unwrap(), "password=old\n");
    }

    #[test]
    fn test_restore_stops_running_worker_before_copying() {
        let dir = tempdir().unwrap();
        let (config, backups, supervisor) = setup(&dir);
        write_live(&config, "first");
        backups.create().unwrap();
        write_live(&config, "second");
        fs::write(config.artifact_path(), "exec sleep 30\n").unwrap();

        let pid = match supervisor.start().unwrap() {
            crate::supervisor::StartOutcome::Started(pid) => pid,
            other => panic!("expected Started, got {:?}", other),
        };

        let report = backups.restore("1", &supervisor).unwrap();
        assert_eq!(report.stopped, StopOutcome::Terminated(pid));
        assert!(!config.pid_path().exists());
        assert!(!crate::process::is_alive(pid));
        assert_eq!(fs::read_to_string(config.log_path()).unwrap(), "log first\n");
        assert_eq!(
            fs::read_to_string(config.data_dir().join("nested/stats.json")).unwrap(),
            "first"
        );
    }
}
