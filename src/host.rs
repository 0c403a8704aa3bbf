//! Host seam. Every call into OS tooling (`systemctl`, `launchctl`,
//! validators, package installers) goes through the `Host` trait.

use std::env;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::debug;

use crate::error::{ManagerError, Result};

/// Captured result of a host command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Turn a non-zero exit into `CommandFailed`.
    pub fn check(self, program: &str, args: &[&str]) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(ManagerError::CommandFailed {
                command: render_command(program, args),
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

pub trait Host: Send + Sync {
    /// Run a program to completion. A program that cannot be found is
    /// `MissingDependency`; a non-zero exit is reported in the output.
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;

    /// Absolute path of `program`, searching `$PATH`.
    fn which(&self, program: &str) -> Option<PathBuf>;

    /// Whether the manager runs with root privilege.
    fn is_elevated(&self) -> bool;

    /// The human user behind this session, looking through `sudo`.
    fn session_user(&self) -> Option<String>;

    fn home_dir(&self) -> Option<PathBuf>;
}

/// The real host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHost;

impl Host for SystemHost {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        debug!(command = %render_command(program, args), "running host command");
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => ManagerError::MissingDependency(program.to_string()),
                _ => ManagerError::Io(e),
            })?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    fn which(&self, program: &str) -> Option<PathBuf> {
        which::which(program).ok()
    }

    fn is_elevated(&self) -> bool {
        // SAFETY: geteuid has no preconditions and cannot fail.
        unsafe { libc::geteuid() == 0 }
    }

    fn session_user(&self) -> Option<String> {
        ["SUDO_USER", "USER", "LOGNAME"]
            .iter()
            .filter_map(|key| env::var(key).ok())
            .find(|v| !v.is_empty())
    }

    fn home_dir(&self) -> Option<PathBuf> {
        dirs::home_dir()
    }
}

pub(crate) fn render_command(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Scripted host for unit tests: simulates `systemctl` and `launchctl`
/// state and records every command.
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeHost {
        pub elevated: bool,
        /// Registrations never report active, even after enabling.
        pub stay_inactive: bool,
        pub missing: Vec<String>,
        /// Rendered commands starting with any of these exit non-zero.
        pub failing: Vec<String>,
        pub home: Option<PathBuf>,
        pub active: Mutex<bool>,
        pub calls: Mutex<Vec<String>>,
    }

    impl FakeHost {
        pub fn elevated() -> Self {
            Self { elevated: true, ..Self::default() }
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub fn set_active(&self, active: bool) {
            *self.active.lock().unwrap() = active;
        }

        pub fn is_active(&self) -> bool {
            *self.active.lock().unwrap()
        }
    }

    impl Host for FakeHost {
        fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
            let rendered = render_command(program, args);
            self.calls.lock().unwrap().push(rendered.clone());

            if self.missing.iter().any(|m| m == program) {
                return Err(ManagerError::MissingDependency(program.to_string()));
            }
            if self.failing.iter().any(|f| rendered.starts_with(f.as_str())) {
                return Ok(CommandOutput {
                    success: false,
                    stdout: String::new(),
                    stderr: "simulated failure".to_string(),
                });
            }

            let mut active = self.active.lock().unwrap();
            let mut out = CommandOutput { success: true, ..CommandOutput::default() };
            match (program, args.first().copied()) {
                ("systemctl", Some("is-active")) => out.success = *active,
                ("systemctl", Some("enable")) | ("systemctl", Some("restart")) => {
                    *active = !self.stay_inactive
                }
                ("systemctl", Some("disable")) => *active = false,
                ("launchctl", Some("load")) => *active = !self.stay_inactive,
                ("launchctl", Some("unload")) => *active = false,
                ("launchctl", Some("list")) => {
                    out.success = *active;
                    if *active {
                        out.stdout = "{\n\t\"PID\" = 4321;\n};\n".to_string();
                    }
                }
                _ => {}
            }
            Ok(out)
        }

        fn which(&self, program: &str) -> Option<PathBuf> {
            if self.missing.iter().any(|m| m == program) {
                None
            } else {
                Some(PathBuf::from("/usr/bin").join(program))
            }
        }

        fn is_elevated(&self) -> bool {
            self.elevated
        }

        fn session_user(&self) -> Option<String> {
            Some("joey".to_string())
        }

        fn home_dir(&self) -> Option<PathBuf> {
            self.home.clone()
        }
    }
}
