// ============================================
// installer.rs - Apply stage
// ============================================
// Runs the Windows package installer against the downloaded MSI:
//
//   msiexec /i "package.msi" /qn /norestart /L*v "install.log" KEY=VALUE ...
//
//   /i         = install
//   /qn        = quiet, no UI
//   /norestart = never reboot, even if the package asks for it
//   /L*v       = verbose log to the given file
//
// Installer-specific options (desktop shortcuts, SSO host, ...) are
// appended as MSI public properties in the order given.
//
// Any non-zero exit code is fatal. That includes 3010 ("success,
// reboot required"); the image build decides when to reboot.
// ============================================

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::StepError;

/// How often a running installer is polled for completion
const POLL_INTERVAL: Duration = Duration::from_millis(250);

// ============================================
// DATA STRUCTURES
// ============================================

/// Everything needed to run one silent install.
#[derive(Debug, Clone)]
pub struct InstallRequest {
    /// The MSI package
    pub package: PathBuf,
    /// Where msiexec writes its verbose log
    pub log_path: PathBuf,
    /// MSI public properties, appended as KEY=VALUE in order
    pub properties: Vec<(String, String)>,
    /// Kill the installer if it runs longer than this
    pub timeout: Option<Duration>,
}

/// What the installer reported.
#[derive(Debug, Clone, PartialEq)]
pub struct InstallOutcome {
    pub exit_code: i32,
    pub log_path: PathBuf,
}

impl InstallOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

// ============================================
// INSTALLER INVOKER
// ============================================

/// Runs a package installer and waits for it.
///
/// Implementations only fail when the installer could not be run to
/// completion. A non-zero exit code is returned as an outcome and
/// judged by the caller.
pub trait InstallerInvoker {
    fn install(&self, request: &InstallRequest) -> Result<InstallOutcome, StepError>;
}

/// The real msiexec.exe.
pub struct Msiexec {
    program: OsString,
}

impl Msiexec {
    pub fn new() -> Self {
        Self {
            program: OsString::from("msiexec"),
        }
    }
}

impl Default for Msiexec {
    fn default() -> Self {
        Self::new()
    }
}

impl InstallerInvoker for Msiexec {
    fn install(&self, request: &InstallRequest) -> Result<InstallOutcome, StepError> {
        let mut command = build_command(&self.program, request);
        debug!(?command, "starting installer");

        let mut child = command.spawn().map_err(StepError::InstallerSpawn)?;

        let start = Instant::now();
        let status = wait_for_exit(&mut child, request.timeout, &request.log_path)?;

        debug!(exit_code = ?status.code(), elapsed_ms = start.elapsed().as_millis() as u64, "installer finished");

        Ok(InstallOutcome {
            // No exit code means the process was terminated by a signal
            exit_code: status.code().unwrap_or(-1),
            log_path: request.log_path.clone(),
        })
    }
}

/// Poll `child` until it exits. Past `timeout` it is killed and reaped.
pub fn wait_for_exit(
    child: &mut Child,
    timeout: Option<Duration>,
    log_path: &Path,
) -> Result<ExitStatus, StepError> {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait().map_err(StepError::InstallerWait)? {
            return Ok(status);
        }
        if let Some(timeout) = timeout {
            if start.elapsed() > timeout {
                warn!("Installer exceeded {}s, killing it", timeout.as_secs());
                let _ = child.kill();
                let _ = child.wait();
                return Err(StepError::InstallerTimeout {
                    timeout,
                    log: log_path.to_path_buf(),
                });
            }
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// msiexec command line, split in two.
#[derive(Debug, Clone, PartialEq)]
pub struct MsiexecArgs {
    /// Switches and paths, quoted normally by `Command`
    pub switches: Vec<OsString>,
    /// KEY=VALUE properties, exactly as msiexec must see them
    pub properties: Vec<String>,
}

/// Build the msiexec arguments for a request.
pub fn msiexec_args(request: &InstallRequest) -> MsiexecArgs {
    let switches: Vec<OsString> = vec![
        "/i".into(),
        request.package.clone().into_os_string(),
        "/qn".into(),
        "/norestart".into(),
        "/L*v".into(),
        request.log_path.clone().into_os_string(),
    ];

    let properties = request
        .properties
        .iter()
        .map(|(key, value)| format_property(key, value))
        .collect();

    MsiexecArgs {
        switches,
        properties,
    }
}

/// Quote property values containing spaces: INSTALLDIR="C:\Program Files\7-Zip"
fn format_property(key: &str, value: &str) -> String {
    if value.contains(' ') {
        format!("{}=\"{}\"", key, value)
    } else {
        format!("{}={}", key, value)
    }
}

/// Assemble the installer command.
///
/// msiexec does its own command-line parsing and does not understand the
/// `\"` escaping `Command::arg` applies on Windows, so properties go in
/// with `raw_arg` there.
fn build_command(program: &OsStr, request: &InstallRequest) -> Command {
    let args = msiexec_args(request);
    let mut command = Command::new(program);
    command.args(&args.switches);

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        for property in &args.properties {
            command.raw_arg(property);
        }
    }
    #[cfg(not(windows))]
    command.args(&args.properties);

    command
}

// ============================================
// APPLY
// ============================================

/// Run the installer and treat anything but exit code 0 as failure.
pub fn apply(
    invoker: &dyn InstallerInvoker,
    request: &InstallRequest,
) -> Result<InstallOutcome, StepError> {
    let outcome = invoker.install(request)?;
    if !outcome.succeeded() {
        return Err(StepError::InstallerExit {
            code: outcome.exit_code,
            log: outcome.log_path,
        });
    }
    Ok(outcome)
}

// ============================================
// TESTS
// ============================================
