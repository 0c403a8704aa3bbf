//! The worker's `key=value` credential file.
//!
//! The worker owns this file and writes its defaults on first run. We only
//! read it and rewrite the `password` and `path` lines, leaving every other
//! byte (comments, unknown keys, line endings) exactly as it was.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{ManagerError, Result};

pub const PASSWORD_KEY: &str = "password";
pub const PATH_KEY: &str = "path";

/// One line of the file. `raw` holds its exact bytes, terminator included.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Entry { key: String, raw_key: String, value: String, raw: String },
    Other(String),
}

impl Line {
    fn parse(raw: &str) -> Self {
        let body = raw.trim_end_matches(&['\r', '\n'][..]);
        let trimmed = body.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return Line::Other(raw.to_string());
        }
        match body.split_once('=') {
            Some((raw_key, value)) => Line::Entry {
                key: raw_key.trim().to_lowercase(),
                raw_key: raw_key.to_string(),
                value: value.trim().to_string(),
                raw: raw.to_string(),
            },
            None => Line::Other(raw.to_string()),
        }
    }

    fn raw(&self) -> &str {
        match self {
            Line::Entry { raw, .. } | Line::Other(raw) => raw,
        }
    }

    fn raw_mut(&mut self) -> &mut String {
        match self {
            Line::Entry { raw, .. } | Line::Other(raw) => raw,
        }
    }
}

fn line_ending(raw: &str) -> &'static str {
    if raw.ends_with("\r\n") {
        "\r\n"
    } else if raw.ends_with('\n') {
        "\n"
    } else {
        ""
    }
}

/// Parsed view of the credential file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialConfig {
    pub password: Option<String>,
    /// As written in the file, without normalization.
    pub security_path: Option<String>,
    pub raw: String,
    lines: Vec<Line>,
}

impl CredentialConfig {
    pub fn parse(raw: &str) -> Self {
        let lines: Vec<Line> = raw.split_inclusive('\n').map(Line::parse).collect();
        // The worker applies entries top to bottom, so the last one wins.
        let lookup = |wanted: &str| {
            lines.iter().rev().find_map(|line| match line {
                Line::Entry { key, value, .. } if key.as_str() == wanted => Some(value.clone()),
                _ => None,
            })
        };
        Self {
            password: lookup(PASSWORD_KEY),
            security_path: lookup(PATH_KEY),
            raw: raw.to_string(),
            lines,
        }
    }

    /// Rewrite every entry line carrying `wanted`, or append a new line.
    fn set(&mut self, wanted: &str, new_value: &str) {
        let mut found = false;
        for line in &mut self.lines {
            if let Line::Entry { key, raw_key, value, raw } = line {
                if key.as_str() == wanted {
                    let ending = line_ending(raw);
                    *value = new_value.to_string();
                    *raw = format!("{}={}{}", raw_key, new_value, ending);
                    found = true;
                }
            }
        }
        if found {
            return;
        }

        if let Some(last) = self.lines.last_mut() {
            if line_ending(last.raw()).is_empty() {
                last.raw_mut().push('\n');
            }
        }
        self.lines.push(Line::Entry {
            key: wanted.to_string(),
            raw_key: wanted.to_string(),
            value: new_value.to_string(),
            raw: format!("{}={}\n", wanted, new_value),
        });
    }

    fn render(&self) -> String {
        self.lines.iter().map(Line::raw).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    NoChanges,
    Updated { backup: PathBuf, changed: Vec<&'static str> },
}

/// Strip surrounding `/` and put exactly one back in front.
pub fn normalize_path(path: &str) -> Result<String> {
    let inner = path.trim().trim_matches('/');
    if inner.is_empty() {
        return Err(ManagerError::InvalidSelection(format!(
            "path {:?} has no segment besides separators",
            path
        )));
    }
    Ok(format!("/{}", inner))
}

fn validate_value(field: &str, value: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ManagerError::InvalidSelection(format!("{} must not be empty", field)));
    }
    if value.contains('\n') || value.contains('\r') {
        return Err(ManagerError::InvalidSelection(format!("{} must be a single line", field)));
    }
    Ok(value.to_string())
}

/// Reads and edits the credential file.
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling holding the file as it was before the last mutation.
    pub fn backup_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".bak");
        self.path.with_file_name(name)
    }

    pub fn read(&self) -> Result<CredentialConfig> {
        if !self.path.exists() {
            return Err(ManagerError::ConfigMissing(self.path.clone()));
        }
        let raw = fs::read_to_string(&self.path)?;
        Ok(CredentialConfig::parse(&raw))
    }

    /// Rewrite the supplied fields only. Nothing supplied means no write.
    pub fn mutate(
        &self,
        new_password: Option<&str>,
        new_path: Option<&str>,
    ) -> Result<MutationOutcome> {
        if new_password.is_none() && new_path.is_none() {
            debug!("no credential fields supplied");
            return Ok(MutationOutcome::NoChanges);
        }

        let password = new_password.map(|p| validate_value(PASSWORD_KEY, p)).transpose()?;
        let path = new_path
            .map(|p| validate_value(PATH_KEY, p).and_then(|p| normalize_path(&p)))
            .transpose()?;

        let original = self.read()?;
        let mut updated = original.clone();
        let mut changed = Vec::new();
        if let Some(password) = &password {
            updated.set(PASSWORD_KEY, password);
            changed.push(PASSWORD_KEY);
        }
        if let Some(path) = &path {
            updated.set(PATH_KEY, path);
            changed.push(PATH_KEY);
        }

        let backup = self.backup_path();
        // Copying carries the live file's mode over to the backup.
        fs::copy(&self.path, &backup)?;
        debug!(backup = %backup.display(), "saved credential backup");

        write_atomic(&self.path, &updated.render())?;
        info!(path = %self.path.display(), fields = ?changed, "credentials updated");
        Ok(MutationOutcome::Updated { backup, changed })
    }
}

/// Write to `.tmp`, then rename over the target.
fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()?;
    if let Ok(meta) = fs::metadata(path) {
        fs::set_permissions(&tmp_path, meta.permissions())?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Login details shown to the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginInfo {
    pub password: String,
    pub path: String,
    pub admin_url: String,
}

impl LoginInfo {
    /// `None` unless both fields are present.
    pub fn from_config(config: &CredentialConfig, host: &str, port: u16) -> Option<Self> {
        let password = config.password.clone()?;
        let path = normalize_path(config.security_path.as_deref()?).ok()?;
        let admin_url = format!("http://{}:{}{}/admin", host, port, path);
        Some(Self { password, path, admin_url })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const WORKER_DEFAULT: &str = "# port forwarder config\n\
# format: key=value\n\
\n\
password=s3cr3t-generated\n\
\n\
path=Ab12Cd34\n\
\n\
# examples:\n\
# password=MySecurePassword123!\n\
# path=my_custom_admin_path\n";

    fn store_with(contents: &str) -> (tempfile::TempDir, ConfigStore) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("password.txt");
        fs::write(&path, contents).unwrap();
        (dir, ConfigStore::new(path))
    }

    fn differing_lines(a: &str, b: &str) -> Vec<(String, String)> {
        a.split_inclusive('\n')
            .zip(b.split_inclusive('\n'))
            .filter(|(x, y)| x != y)
            .map(|(x, y)| (x.to_string(), y.to_string()))
            .collect()
    }

    #[test]
    fn test_read_missing() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("password.txt"));
        assert!(matches!(store.read(), Err(ManagerError::ConfigMissing(_))));
    }

    #[test]
    fn test_read_fields_ignore_comments() {
        let (_dir, store) = store_with(WORKER_DEFAULT);
        let config = store.read().unwrap();
        assert_eq!(config.password.as_deref(), Some("s3cr3t-generated"));
        assert_eq!(config.security_path.as_deref(), Some("Ab12Cd34"));
        assert_eq!(config.raw, WORKER_DEFAULT);
    }

    #[test]
    fn test_read_key_is_case_insensitive_and_trimmed() {
        let config = CredentialConfig::parse(" PassWord = hunter2 \nPATH=/x/\n");
        assert_eq!(config.password.as_deref(), Some("hunter2"));
        assert_eq!(config.security_path.as_deref(), Some("/x/"));
    }

    #[test]
    fn test_mutate_password_changes_exactly_one_line() {
        let (_dir, store) = store_with(WORKER_DEFAULT);

        let outcome = store.mutate(Some("X"), None).unwrap();
        let backup = match outcome {
            MutationOutcome::Updated { backup, changed } => {
                assert_eq!(changed, vec![PASSWORD_KEY]);
                backup
            }
            other => panic!("expected Updated, got {:?}", other),
        };

        let before = fs::read_to_string(&backup).unwrap();
        let after = fs::read_to_string(store.path()).unwrap();
        assert_eq!(before, WORKER_DEFAULT);
        assert_eq!(before.lines().count(), after.lines().count());
        assert_eq!(
            differing_lines(&before, &after),
            vec![("password=s3cr3t-generated\n".to_string(), "password=X\n".to_string())]
        );
        assert_eq!(store.read().unwrap().password.as_deref(), Some("X"));
    }

    #[test]
    fn test_backup_keeps_restrictive_mode() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, store) = store_with(WORKER_DEFAULT);
        fs::set_permissions(store.path(), fs::Permissions::from_mode(0o600)).unwrap();
        // A world-readable leftover from an earlier run must not keep its mode.
        fs::write(store.backup_path(), "password=older\n").unwrap();
        fs::set_permissions(store.backup_path(), fs::Permissions::from_mode(0o644)).unwrap();

        store.mutate(Some("new"), None).unwrap();

        let mode = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(store.path()), 0o600);
        assert_eq!(mode(&store.backup_path()), 0o600);
        assert_eq!(fs::read_to_string(store.backup_path()).unwrap(), WORKER_DEFAULT);
    }

    #[test]
    fn test_mutate_path_is_normalized() {
        let (_dir, store) = store_with(WORKER_DEFAULT);
        store.mutate(None, Some("//admin-zone/")).unwrap();

        let config = store.read().unwrap();
        assert_eq!(config.security_path.as_deref(), Some("/admin-zone"));
        assert_eq!(config.password.as_deref(), Some("s3cr3t-generated"));
    }

    #[test]
    fn test_mutate_nothing_supplied_does_not_write() {
        let (_dir, store) = store_with(WORKER_DEFAULT);
        assert_eq!(store.mutate(None, None).unwrap(), MutationOutcome::NoChanges);
        assert!(!store.backup_path().exists());
    }

    #[test]
    fn test_mutate_preserves_crlf_and_unknown_keys() {
        let original = "password=a\r\nport_hint=5000\r\npath=p\r\n";
        let (_dir, store) = store_with(original);
        store.mutate(Some("b"), None).unwrap();

        let after = fs::read_to_string(store.path()).unwrap();
        assert_eq!(after, "password=b\r\nport_hint=5000\r\npath=p\r\n");
    }

    #[test]
    fn test_mutate_appends_missing_key() {
        let (_dir, store) = store_with("password=a");
        store.mutate(None, Some("zone")).unwrap();

        let after = fs::read_to_string(store.path()).unwrap();
        assert_eq!(after, "password=a\npath=/zone\n");
    }

    #[test]
    fn test_mutate_rejects_bad_values_without_writing() {
        let (_dir, store) = store_with(WORKER_DEFAULT);
        assert!(matches!(store.mutate(Some("  "), None), Err(ManagerError::InvalidSelection(_))));
        assert!(matches!(store.mutate(None, Some("///")), Err(ManagerError::InvalidSelection(_))));
        assert!(matches!(store.mutate(Some("a\nb"), None), Err(ManagerError::InvalidSelection(_))));
        assert!(!store.backup_path().exists());
        assert_eq!(fs::read_to_string(store.path()).unwrap(), WORKER_DEFAULT);
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("abc").unwrap(), "/abc");
        assert_eq!(normalize_path("/abc/").unwrap(), "/abc");
        assert_eq!(normalize_path("///a/b//").unwrap(), "/a/b");
    }

    #[test]
    fn test_login_info() {
        let config = CredentialConfig::parse(WORKER_DEFAULT);
        let info = LoginInfo::from_config(&config, "203.0.113.7", 5000).unwrap();
        assert_eq!(info.password, "s3cr3t-generated");
        assert_eq!(info.admin_url, "http://203.0.113.7:5000/Ab12Cd34/admin");

        let partial = CredentialConfig::parse("password=only\n");
        assert!(LoginInfo::from_config(&partial, "localhost", 5000).is_none());
    }
}
