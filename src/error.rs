// ============================================
// error.rs - Stage errors and cleanup warnings
// ============================================
//
// Every pipeline stage returns `Result<_, StepError>`. Each variant
// belongs to exactly one stage, so the driver can report which stage
// failed and pick the exit code without inspecting messages.
//
// Cleanup problems are NOT errors. They are collected as
// `CleanupWarning`s, logged, and never change the run outcome.
// ============================================

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

// ============================================
// STAGES
// ============================================

/// The five pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Resolve,
    Acquire,
    Apply,
    Verify,
    Reclaim,
}

impl Stage {
    /// All stages in the order the pipeline runs them.
    pub const ALL: [Stage; 5] = [
        Stage::Resolve,
        Stage::Acquire,
        Stage::Apply,
        Stage::Verify,
        Stage::Reclaim,
    ];

    /// 1-based position, used in "[2/5] Acquire" progress lines.
    pub fn position(&self) -> usize {
        Stage::ALL.iter().position(|s| s == self).unwrap_or(0) + 1
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Resolve => "Resolve",
            Stage::Acquire => "Acquire",
            Stage::Apply => "Apply",
            Stage::Verify => "Verify",
            Stage::Reclaim => "Reclaim",
        }
    }

    /// Name of the error kind raised by this stage.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Stage::Resolve => "ResolutionError",
            Stage::Acquire => "AcquisitionError",
            Stage::Apply => "InstallationError",
            Stage::Verify => "VerificationError",
            Stage::Reclaim => "CleanupWarning",
        }
    }

    /// Process exit code when this stage fails.
    /// Exit code 1 is reserved for configuration / CLI problems.
    pub fn exit_code(&self) -> u8 {
        match self {
            Stage::Resolve => 2,
            Stage::Acquire => 3,
            Stage::Apply => 4,
            Stage::Verify => 5,
            // Reclaim never fails a run
            Stage::Reclaim => 0,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================
// FATAL STAGE ERRORS
// ============================================

/// A fatal failure in one of the first four stages.
#[derive(Error, Debug)]
pub enum StepError {
    // --- Resolve ---
    /// The release index could not be fetched or parsed
    #[error("release metadata unavailable: {0}")]
    ReleaseIndex(String),

    /// No asset in the release ends with the expected suffix
    #[error("no release asset matches '{suffix}' (available: {available})")]
    NoMatchingAsset { suffix: String, available: String },

    /// Version string is not at least major.minor
    #[error("version '{version}' is not a dotted major.minor version")]
    InvalidVersion { version: String },

    // --- Acquire ---
    /// Destination directory could not be created
    #[error("could not create download directory {path}: {source}")]
    DownloadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Transport failure or non-success HTTP status
    #[error("download of {url} failed: {reason}")]
    Download { url: String, reason: String },

    // --- Apply ---
    /// Installer log directory could not be created
    #[error("could not create log directory {path}: {source}")]
    LogDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The installer executable could not be started
    #[error("could not start installer: {0}")]
    InstallerSpawn(#[source] std::io::Error),

    /// The installer started but could not be waited on
    #[error("lost track of running installer: {0}")]
    InstallerWait(#[source] std::io::Error),

    /// The installer ran but returned a non-zero exit code
    #[error("installer exited with code {code} (log: {log})")]
    InstallerExit { code: i32, log: PathBuf },

    /// The installer did not finish within the configured bound
    #[error("installer did not finish within {}s and was killed (log: {log})", .timeout.as_secs())]
    InstallerTimeout { timeout: Duration, log: PathBuf },

    // --- Verify ---
    /// The installed-software database could not be read
    #[error("installed software query failed: {0}")]
    RegistryQuery(String),

    /// Nothing installed matches the display-name pattern
    #[error("no installed product matches '{pattern}'")]
    NotInstalled { pattern: String },

    /// More than one installed product matches the pattern
    #[error("{} installed products match '{pattern}': {}", .matches.len(), .matches.join(", "))]
    AmbiguousInstall {
        pattern: String,
        matches: Vec<String>,
    },

    /// Installed version differs from the expected one
    #[error("{name} is installed at version {installed}, expected {expected} ({policy} match)")]
    VersionMismatch {
        name: String,
        installed: String,
        expected: String,
        policy: String,
    },
}

impl StepError {
    /// The stage that raises this error.
    pub fn stage(&self) -> Stage {
        match self {
            StepError::ReleaseIndex(_)
            | StepError::NoMatchingAsset { .. }
            | StepError::InvalidVersion { .. } => Stage::Resolve,
            StepError::DownloadDir { .. } | StepError::Download { .. } => Stage::Acquire,
            StepError::LogDir { .. }
            | StepError::InstallerSpawn(_)
            | StepError::InstallerWait(_)
            | StepError::InstallerExit { .. }
            | StepError::InstallerTimeout { .. } => Stage::Apply,
            StepError::RegistryQuery(_)
            | StepError::NotInstalled { .. }
            | StepError::AmbiguousInstall { .. }
            | StepError::VersionMismatch { .. } => Stage::Verify,
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.stage().exit_code()
    }
}

// ============================================
// NON-FATAL CLEANUP WARNINGS
// ============================================

/// Something Reclaim could not delete. Logged, never fatal.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanupWarning {
    pub path: PathBuf,
    pub message: String,
}

impl CleanupWarning {
    pub fn new(path: impl Into<PathBuf>, message: impl fmt::Display) -> Self {
        Self {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

impl fmt::Display for CleanupWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "could not remove {}: {}", self.path.display(), self.message)
    }
}

// ============================================
// TESTS
// ============================================
