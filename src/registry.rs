// ============================================
// registry.rs - Verify stage
// ============================================
// Confirms the install actually happened, using the Windows
// "Programs and Features" data instead of trusting msiexec's exit code.
//
// Installed programs register under:
//   HKLM\SOFTWARE\Microsoft\Windows\CurrentVersion\Uninstall\*
//   HKLM\SOFTWARE\WOW6432Node\Microsoft\Windows\CurrentVersion\Uninstall\*
// with DisplayName and DisplayVersion values.
//
// We read them through PowerShell (one "Name|Version" line per product)
// and do all filtering and comparison here in Rust.
// ============================================

use regex::Regex;
use std::process::Command;
use tracing::{debug, info};

use crate::error::StepError;
use crate::version::VersionPolicy;

/// Lists every registered product as "DisplayName|DisplayVersion".
const UNINSTALL_QUERY: &str = r#"$paths = 'HKLM:\SOFTWARE\Microsoft\Windows\CurrentVersion\Uninstall\*', 'HKLM:\SOFTWARE\WOW6432Node\Microsoft\Windows\CurrentVersion\Uninstall\*'; Get-ItemProperty -Path $paths -ErrorAction SilentlyContinue | Where-Object { $_.DisplayName } | ForEach-Object { "$($_.DisplayName)|$($_.DisplayVersion)" }"#;

// ============================================
// DATA STRUCTURES
// ============================================

/// One installed product, as the registry reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct InstalledRecord {
    pub display_name: String,
    pub display_version: String,
}

impl InstalledRecord {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            display_name: name.into(),
            display_version: version.into(),
        }
    }
}

/// A DisplayName wildcard such as "7-Zip*" or "Zoom*VDI*".
/// `*` matches any run of characters; matching ignores case.
#[derive(Debug, Clone)]
pub struct NamePattern {
    source: String,
    regex: Regex,
}

impl NamePattern {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let body = pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        let regex = Regex::new(&format!("(?i)^{}$", body))?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, display_name: &str) -> bool {
        self.regex.is_match(display_name.trim())
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

// ============================================
// INSTALLED SOFTWARE SOURCE
// ============================================

/// Read-only view of what is installed on the machine.
pub trait InstalledSoftware {
    fn installed(&self) -> Result<Vec<InstalledRecord>, StepError>;
}

/// The machine's Uninstall registry keys, read through PowerShell.
pub struct UninstallRegistry;

impl InstalledSoftware for UninstallRegistry {
    fn installed(&self) -> Result<Vec<InstalledRecord>, StepError> {
        let output = Command::new("powershell")
            .args(["-NoProfile", "-NonInteractive", "-Command", UNINSTALL_QUERY])
            .output()
            .map_err(|e| StepError::RegistryQuery(format!("failed to run PowerShell: {}", e)))?;

        if !output.status.success() {
            return Err(StepError::RegistryQuery(format!(
                "PowerShell exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let records = parse_uninstall_listing(&String::from_utf8_lossy(&output.stdout));
        debug!("{} installed products listed", records.len());
        Ok(records)
    }
}

/// Parse "DisplayName|DisplayVersion" lines.
///
/// The version is everything after the LAST '|', so product names
/// containing '|' survive. Lines without a separator are skipped.
pub fn parse_uninstall_listing(stdout: &str) -> Vec<InstalledRecord> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let (name, version) = line.rsplit_once('|')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some(InstalledRecord::new(name, version.trim()))
        })
        .collect()
}

// ============================================
// VERIFY
// ============================================

/// Check that exactly one installed product matches `pattern` and that
/// its version satisfies `expected` under `policy`.
pub fn verify(
    software: &dyn InstalledSoftware,
    pattern: &NamePattern,
    expected: &str,
    policy: VersionPolicy,
) -> Result<InstalledRecord, StepError> {
    let mut matches: Vec<InstalledRecord> = software
        .installed()?
        .into_iter()
        .filter(|r| pattern.matches(&r.display_name))
        .collect();

    let record = match matches.len() {
        0 => {
            return Err(StepError::NotInstalled {
                pattern: pattern.as_str().to_string(),
            })
        }
        1 => matches.remove(0),
        _ => {
            return Err(StepError::AmbiguousInstall {
                pattern: pattern.as_str().to_string(),
                matches: matches
                    .iter()
                    .map(|r| format!("{} {}", r.display_name, r.display_version))
                    .collect(),
            })
        }
    };

    if !policy.matches(&record.display_version, expected) {
        return Err(StepError::VersionMismatch {
            name: record.display_name,
            installed: record.display_version,
            expected: expected.to_string(),
            policy: policy.to_string(),
        });
    }

    info!(
        "Found {} {} ({} match against {})",
        record.display_name, record.display_version, policy, expected
    );
    Ok(record)
}

// ============================================
// TESTS
// ============================================
