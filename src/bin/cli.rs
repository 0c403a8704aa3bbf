//! fwdctl - interactive manager for the port forwarder worker.
//!
//! Usage:
//!   fwdctl                          # menu for the worker in the current directory
//!   fwdctl --base-dir /srv/fwd      # menu for a worker elsewhere
//!   fwdctl --config ./fwdctl.toml   # explicit manager config
//!   fwdctl -vv                      # debug logging on stderr

use anyhow::Result;
use clap::Parser;
use fwdctl::{
    confirmed, maintenance, AutostartRegistration, ControlPlane, Manager, ManagerConfig,
    MutationOutcome, RemoveOutcome, ServiceRunState, StartOutcome, StopOutcome, SystemHost,
    CONFIRM_TOKEN,
};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const LOG_TAIL_LINES: usize = 50;

#[derive(Parser)]
#[command(name = "fwdctl")]
#[command(about = "fwdctl - lifecycle manager for the port forwarder worker", long_about = None)]
struct Cli {
    /// Directory holding the worker artifact (default: current directory)
    #[arg(short, long, default_value = ".")]
    base_dir: PathBuf,

    /// Manager config file (default: <base-dir>/fwdctl.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// More log output on stderr (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("fwdctl={}", level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let base_dir = cli.base_dir.canonicalize().unwrap_or(cli.base_dir);
    let config = ManagerConfig::load(&base_dir, cli.config.as_deref())?;
    let manager = Manager::open(config, Arc::new(SystemHost))?;
    let mut input = io::stdin().lock();

    loop {
        print_menu(&manager);
        let Some(choice) = prompt(&mut input, "Select")? else {
            println!();
            return Ok(());
        };

        let result = match choice.as_str() {
            "0" | "q" | "exit" => return Ok(()),
            "1" => install_deps(&manager),
            "2" => start(&manager),
            "3" => stop(&manager),
            "4" => restart(&manager),
            "5" => status(&manager),
            "6" => logs(&manager),
            "7" => view_config(&manager),
            "8" => modify_config(&manager, &mut input),
            "9" => backup(&manager),
            "10" => restore(&manager, &mut input),
            "11" => clean(&manager, &mut input),
            "12" => enable_autostart(&manager),
            "13" => disable_autostart(&manager),
            "14" => update(&manager, &mut input),
            "15" | "h" | "help" => {
                print_help(&manager);
                Ok(())
            }
            "" => continue,
            other => {
                println!("Unknown option '{}'", other);
                continue;
            }
        };

        if let Err(e) = result {
            eprintln!("Error: {}: {:#}", action_name(&choice), e);
        }
        println!();
    }
}

fn print_menu(manager: &Manager) {
    println!("Port Forwarder Manager  [{}]", manager.status());
    println!("══════════════════════════════════════");
    println!("  1) Install dependencies    9) Backup");
    println!("  2) Start                  10) Restore");
    println!("  3) Stop                   11) Clean");
    println!("  4) Restart                12) Enable autostart");
    println!("  5) Status                 13) Disable autostart");
    println!("  6) View logs              14) Update worker");
    println!("  7) View config            15) Help");
    println!("  8) Modify config           0) Exit");
}

fn action_name(choice: &str) -> &'static str {
    match choice {
        "1" => "install dependencies",
        "2" => "start",
        "3" => "stop",
        "4" => "restart",
        "5" => "status",
        "6" => "view logs",
        "7" => "view config",
        "8" => "modify config",
        "9" => "backup",
        "10" => "restore",
        "11" => "clean",
        "12" => "enable autostart",
        "13" => "disable autostart",
        "14" => "update",
        _ => "command",
    }
}

/// Read one trimmed line. `None` at end of input.
fn prompt(input: &mut impl BufRead, label: &str) -> Result<Option<String>> {
    print!("{}: ", label);
    io::stdout().flush()?;
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

fn ask_yes(input: &mut impl BufRead, question: &str) -> Result<bool> {
    let answer = prompt(input, &format!("{} [y/N]", question))?.unwrap_or_default();
    Ok(matches!(answer.to_lowercase().as_str(), "y" | "yes"))
}

fn ask_confirm(input: &mut impl BufRead, what: &str) -> Result<bool> {
    println!("This will {}.", what);
    let answer = prompt(input, &format!("Type {} to proceed", CONFIRM_TOKEN))?.unwrap_or_default();
    if confirmed(&answer) {
        Ok(true)
    } else {
        println!("Cancelled.");
        Ok(false)
    }
}

fn install_deps(manager: &Manager) -> Result<()> {
    println!("Installing worker dependencies...");
    let output = maintenance::install_dependencies(&manager.config, manager.host.as_ref())?;
    if !output.trim().is_empty() {
        println!("{}", output.trim_end());
    }
    println!("✓ Dependencies installed");
    Ok(())
}

fn start(manager: &Manager) -> Result<()> {
    match manager.supervisor.start()? {
        StartOutcome::Started(pid) => println!("✓ Worker started (pid {})", pid),
        StartOutcome::AlreadyRunning(state) => println!("Worker already {}", state),
    }
    if matches!(manager.status(), ServiceRunState::RunningManual(_)) {
        print_manual_mode_note(manager);
    }
    Ok(())
}

fn stop(manager: &Manager) -> Result<()> {
    print_stop(manager.supervisor.stop()?);
    if let ServiceRunState::RunningUnderServiceManager(name) = manager.status() {
        println!("Note: the worker is still running under the service manager ({}).", name);
        println!("Use 13) Disable autostart to stop it.");
    }
    Ok(())
}

fn print_stop(outcome: StopOutcome) {
    match outcome {
        StopOutcome::NotRunning => println!("Worker is not running (manual mode)"),
        StopOutcome::Terminated(pid) => println!("✓ Worker stopped (pid {})", pid),
        StopOutcome::Killed(pid) => println!("✓ Worker force-killed (pid {})", pid),
        StopOutcome::AlreadyExited(pid) => {
            println!("Worker pid {} had already exited, cleaned up", pid)
        }
    }
}

fn restart(manager: &Manager) -> Result<()> {
    let (stopped, started) = manager.supervisor.restart()?;
    print_stop(stopped);
    match started {
        StartOutcome::Started(pid) => println!("✓ Worker started (pid {})", pid),
        StartOutcome::AlreadyRunning(state) => println!("Worker already {}", state),
    }
    Ok(())
}

fn print_manual_mode_note(manager: &Manager) {
    if !matches!(manager.autostart().registration(), AutostartRegistration::Unregistered) {
        println!("Note: an autostart registration exists; manual start/stop does not affect it.");
    }
}

fn status(manager: &Manager) -> Result<()> {
    let state = manager.status();
    println!("Worker:     {}", state);
    match manager.autostart().registration() {
        AutostartRegistration::Unregistered => println!("Autostart:  not registered"),
        AutostartRegistration::SystemUnit { unit_file_path, unit_name, run_as_user } => println!(
            "Autostart:  system unit {} as {} ({})",
            unit_name,
            run_as_user,
            unit_file_path.display()
        ),
        AutostartRegistration::LaunchAgent { plist_path, label } => {
            println!("Autostart:  launch agent {} ({})", label, plist_path.display())
        }
    }
    println!("Artifact:   {}", present(&manager.config.artifact_path()));
    println!("Config:     {}", present(&manager.config.credentials_path()));
    println!("Log:        {}", manager.config.log_path().display());

    if state.is_running() {
        let address = manager.public_address();
        if let Ok(Some(info)) = manager.login_info(address.as_deref()) {
            println!("Admin URL:  {}", info.admin_url);
        }
    }
    Ok(())
}

fn present(path: &std::path::Path) -> String {
    if path.exists() {
        path.display().to_string()
    } else {
        format!("{} (missing)", path.display())
    }
}

fn logs(manager: &Manager) -> Result<()> {
    let path = manager.config.log_path();
    let lines = maintenance::tail_log(&path, LOG_TAIL_LINES)?;
    if lines.is_empty() {
        println!("No log output yet ({})", path.display());
        return Ok(());
    }
    println!("── last {} lines of {} ──", lines.len(), path.display());
    for line in lines {
        println!("{}", line);
    }
    Ok(())
}

fn view_config(manager: &Manager) -> Result<()> {
    let address = manager.public_address();
    match manager.login_info(address.as_deref()) {
        Ok(Some(info)) => {
            println!("Password:   {}", info.password);
            println!("Path:       {}", info.path);
            println!("Admin URL:  {}", info.admin_url);
            if address.is_none() {
                println!("(public address unknown, replace localhost with this host's IP)");
            }
            Ok(())
        }
        Ok(None) => {
            println!("{} lacks a password or path entry", manager.credentials.path().display());
            Ok(())
        }
        Err(fwdctl::ManagerError::ConfigMissing(path)) => {
            println!(
                "{} does not exist yet; start the worker once to generate it.",
                path.display()
            );
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn modify_config(manager: &Manager, input: &mut impl BufRead) -> Result<()> {
    let current = manager.credentials.read()?;
    println!("Leave a field empty to keep it.");
    println!("Current password: {}", current.password.as_deref().unwrap_or("(unset)"));
    let password = prompt(input, "New password")?.filter(|s| !s.is_empty());
    println!("Current path: {}", current.security_path.as_deref().unwrap_or("(unset)"));
    let path = prompt(input, "New path")?.filter(|s| !s.is_empty());

    match manager.credentials.mutate(password.as_deref(), path.as_deref())? {
        MutationOutcome::NoChanges => {
            println!("No changes.");
            return Ok(());
        }
        MutationOutcome::Updated { backup, changed } => {
            println!(
                "✓ Updated {} (previous version at {})",
                changed.join(", "),
                backup.display()
            );
        }
    }

    if let Some(plane) = manager.active_plane() {
        if ask_yes(input, "Restart the worker to apply the change?")? {
            manager.restart_via(&plane)?;
            println!("✓ Worker restarted");
        }
    }
    Ok(())
}

fn backup(manager: &Manager) -> Result<()> {
    let snapshot = manager.backups.create()?;
    println!("✓ Backup created: {}", snapshot.path.display());
    Ok(())
}

fn restore(manager: &Manager, input: &mut impl BufRead) -> Result<()> {
    let snapshots = manager.backups.list()?;
    if snapshots.is_empty() {
        println!("No backups in {}", manager.backups.root().display());
        return Ok(());
    }
    for (i, snap) in snapshots.iter().enumerate() {
        println!("  {}) {}", i + 1, snap.timestamp);
    }
    let selection = prompt(input, "Backup number")?.unwrap_or_default();
    let chosen = manager.backups.select(&selection)?;
    println!("Selected {}", chosen.timestamp);

    if !ask_confirm(input, "stop the worker and overwrite its data, config and log")? {
        return Ok(());
    }
    let report = manager.backups.restore(&selection, &manager.supervisor)?;
    print_stop(report.stopped);
    println!("✓ Restored {} from {}", report.restored.len(), report.snapshot.timestamp);
    for path in &report.skipped {
        println!("  kept {} (not in backup)", path.display());
    }
    println!("The worker was not restarted; use 2) Start when ready.");
    Ok(())
}

fn clean(manager: &Manager, input: &mut impl BufRead) -> Result<()> {
    if !ask_confirm(input, "stop the worker and delete its data directory and log")? {
        return Ok(());
    }
    let report = maintenance::clean(&manager.config, &manager.supervisor)?;
    print_stop(report.stopped);
    for path in &report.removed {
        println!("  removed {}", path.display());
    }
    println!("✓ Clean complete");
    Ok(())
}

fn enable_autostart(manager: &Manager) -> Result<()> {
    match manager.autostart().install()? {
        AutostartRegistration::SystemUnit { unit_name, run_as_user, .. } => {
            println!("✓ Service {} enabled and running as {}", unit_name, run_as_user)
        }
        AutostartRegistration::LaunchAgent { label, .. } => {
            println!("✓ Launch agent {} loaded and running", label)
        }
        AutostartRegistration::Unregistered => {}
    }
    Ok(())
}

fn disable_autostart(manager: &Manager) -> Result<()> {
    match manager.autostart().remove()? {
        RemoveOutcome::Removed => println!("✓ Autostart removed"),
        RemoveOutcome::NotInstalled => println!("Autostart is not installed"),
    }
    Ok(())
}

fn update(manager: &Manager, input: &mut impl BufRead) -> Result<()> {
    println!("Updating {}...", manager.updater.artifact().display());
    let outcome = manager.updater.run(manager.probe())?;
    match &outcome.backup {
        Some(backup) => {
            println!("✓ Worker updated (previous version kept at {})", backup.display())
        }
        None => println!("✓ Worker installed"),
    }

    if let Some(plane) = outcome.restart_offer {
        let how = match &plane {
            ControlPlane::ServiceManager(name) => format!("through the service manager ({})", name),
            ControlPlane::Manual => "manually".to_string(),
        };
        if ask_yes(input, &format!("Restart the worker {} now?", how))? {
            manager.restart_via(&plane)?;
            println!("✓ Worker restarted");
        }
    }
    Ok(())
}

fn print_help(manager: &Manager) {
    println!("Port Forwarder Manager - help");
    println!();
    println!("Files (under {}):", manager.config.base_dir.display());
    println!("  worker    {}", manager.config.artifact_path().display());
    println!("  config    {}", manager.config.credentials_path().display());
    println!("  log       {}", manager.config.log_path().display());
    println!("  data      {}", manager.config.data_dir().display());
    println!("  backups   {}", manager.backups.root().display());
    println!("  pid file  {}", manager.config.pid_path().display());
    println!();
    println!("Start/Stop/Restart control a manually launched worker only.");
    println!("A worker registered for autostart is controlled by the service");
    println!("manager; disable autostart to stop it.");
    println!();
    println!("Restore and Clean ask you to type {} before they run.", CONFIRM_TOKEN);
    println!("Backups are never deleted automatically.");
    println!();
    println!("Enabling autostart on Linux needs root (run with sudo).");
}
