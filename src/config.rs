// ============================================
// config.rs - Run configuration
// ============================================
// Settings come from three places, later ones win:
//   1. Built-in defaults (below)
//   2. An optional TOML file passed with --config
//   3. Command line flags
//
// Example avdprep.toml:
//
//   work_dir = 'C:\ImageBuild\Temp'
//   log_dir = 'C:\ImageBuild\Logs'
//   log_retention_days = 14
//
//   [seven_zip]
//   install_path = 'C:\Program Files\7-Zip'
//
//   [zoom_vdi]
//   version = "6.2.10"
//   sso_host = "contoso"
// ============================================

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::version::VersionPolicy;

// ============================================
// TOP-LEVEL CONFIG
// ============================================

/// Everything a run needs besides the product itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Parent folder for per-run scratch folders
    pub work_dir: PathBuf,

    /// Where installer logs are written and old logs pruned
    pub log_dir: PathBuf,

    /// Logs older than this many days are deleted during cleanup
    pub log_retention_days: u64,

    /// Skip the cleanup stage entirely (nothing is deleted)
    pub no_cleanup: bool,

    /// Also delete the scratch folder when the run fails.
    /// Off by default so the package stays around for diagnosis.
    pub cleanup_on_failure: bool,

    /// Timeout for release metadata requests
    pub metadata_timeout_secs: u64,

    /// Timeout for the installer download
    pub download_timeout_secs: u64,

    /// Timeout for msiexec. 0 waits forever.
    pub install_timeout_secs: u64,

    pub seven_zip: SevenZipConfig,
    pub zoom_vdi: ZoomVdiConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        let base = default_base_dir();
        Self {
            work_dir: base.join("Temp"),
            log_dir: base.join("Logs"),
            log_retention_days: 7,
            no_cleanup: false,
            cleanup_on_failure: false,
            metadata_timeout_secs: 30,
            download_timeout_secs: 30 * 60,
            install_timeout_secs: 60 * 60,
            seven_zip: SevenZipConfig::default(),
            zoom_vdi: ZoomVdiConfig::default(),
        }
    }
}

impl RunConfig {
    /// Load from a TOML file, or defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                Self::from_toml(&text)
                    .with_context(|| format!("Invalid config file {}", path.display()))
            }
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    /// `None` means no limit.
    pub fn install_timeout(&self) -> Option<Duration> {
        match self.install_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// C:\ImageBuild on Windows image builders, a temp folder elsewhere.
fn default_base_dir() -> PathBuf {
    if cfg!(windows) {
        let drive = std::env::var("SystemDrive").unwrap_or_else(|_| "C:".to_string());
        PathBuf::from(format!("{}\\", drive)).join("ImageBuild")
    } else {
        std::env::temp_dir().join("avdprep")
    }
}

// ============================================
// PRODUCT SECTIONS
// ============================================

/// [seven_zip] - latest 7-Zip from GitHub releases
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SevenZipConfig {
    /// GitHub "latest release" API endpoint
    pub release_api_url: String,

    /// Asset filename suffix that identifies the right MSI
    pub asset_suffix: String,

    pub architecture: String,

    /// Passed to the MSI as INSTALLDIR when set
    pub install_path: Option<PathBuf>,

    /// DisplayName wildcard in the Uninstall registry
    pub display_name: String,

    /// The registry reports "24.08.00.0" for the "24.08" tag
    pub version_policy: VersionPolicy,
}

impl Default for SevenZipConfig {
    fn default() -> Self {
        Self {
            release_api_url: "https://api.github.com/repos/ip7z/7zip/releases/latest".to_string(),
            asset_suffix: "-x64.msi".to_string(),
            architecture: "x64".to_string(),
            install_path: None,
            display_name: "7-Zip*".to_string(),
            version_policy: VersionPolicy::MajorMinor,
        }
    }
}

/// [zoom_vdi] - pinned Zoom VDI client from zoom.us
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoomVdiConfig {
    /// Version to install, e.g. "6.2.10". Required for a Zoom run.
    pub version: Option<String>,

    /// Company SSO host pre-seeded into the client (ZSSOHOST)
    pub sso_host: Option<String>,

    /// Downloads come from {download_base}/{version}/ZoomInstallerVDI.msi
    pub download_base: String,

    pub architecture: String,

    /// Don't put a Zoom shortcut on the public desktop
    pub no_desktop_shortcut: bool,

    pub display_name: String,

    pub version_policy: VersionPolicy,
}

impl Default for ZoomVdiConfig {
    fn default() -> Self {
        Self {
            version: None,
            sso_host: None,
            download_base: "https://zoom.us/download/vdi".to_string(),
            architecture: "x64".to_string(),
            no_desktop_shortcut: true,
            display_name: "Zoom*VDI*".to_string(),
            version_policy: VersionPolicy::Exact,
        }
    }
}

// ============================================
// TESTS
// ============================================
