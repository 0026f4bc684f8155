// ============================================
// version.rs - Version strings and comparison policies
// ============================================
// Installers and registries disagree on how precise a version is.
// GitHub may tag 7-Zip as "24.08" while the registry reports
// "24.08.00.0". The comparison policy is therefore chosen per product.
// ============================================

use serde::{Deserialize, Serialize};
use std::fmt;

/// How an installed version is compared against the expected one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VersionPolicy {
    /// Whole strings must be equal (after trimming whitespace)
    Exact,
    /// Only the first two dot-separated components must be equal
    MajorMinor,
}

impl VersionPolicy {
    /// Returns true if `installed` satisfies `expected` under this policy.
    ///
    /// Examples:
    ///   Exact.matches("21.07.1", "21.07")      => false
    ///   MajorMinor.matches("21.07.1", "21.07") => true
    ///   MajorMinor.matches("21.08.0", "21.07") => false
    pub fn matches(&self, installed: &str, expected: &str) -> bool {
        match self {
            VersionPolicy::Exact => installed.trim() == expected.trim(),
            VersionPolicy::MajorMinor => {
                let installed = components(installed);
                let expected = components(expected);
                if installed.len() < 2 || expected.len() < 2 {
                    return false;
                }
                installed[..2]
                    .iter()
                    .zip(&expected[..2])
                    .all(|(a, b)| component_eq(a, b))
            }
        }
    }
}

impl fmt::Display for VersionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionPolicy::Exact => f.write_str("exact"),
            VersionPolicy::MajorMinor => f.write_str("major-minor"),
        }
    }
}

/// Split a version into its dot-separated components.
pub fn components(version: &str) -> Vec<&str> {
    version.trim().split('.').collect()
}

/// "08" and "8" are the same component; non-numeric parts compare as text.
fn component_eq(a: &str, b: &str) -> bool {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x == y,
        _ => a == b,
    }
}

/// A usable version has at least major.minor, both numeric,
/// and no empty components ("24.", ".08", "24..1" are rejected).
pub fn is_dotted_version(version: &str) -> bool {
    let parts = components(version);
    if parts.len() < 2 || parts.iter().any(|p| p.is_empty()) {
        return false;
    }
    parts[..2]
        .iter()
        .all(|p| p.chars().all(|c| c.is_ascii_digit()))
}

// ============================================
// TESTS
// ============================================
