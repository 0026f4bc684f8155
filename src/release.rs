// ============================================
// release.rs - Resolve stage
// ============================================
// This module decides WHAT to install before anything touches the
// machine. It produces a `ReleaseDescriptor` (version + download URL).
//
// Two ways to resolve a release:
// 1. GitHub latest release: ask the GitHub API for the latest release,
//    take the version from the tag, and pick the asset whose filename
//    ends with the expected suffix (e.g. "-x64.msi").
// 2. Pinned: the operator supplies a version, and the download URL is
//    built from a template. No network call.
// ============================================

use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::error::StepError;
use crate::version::is_dotted_version;

// ============================================
// DATA STRUCTURES
// ============================================

/// Everything later stages need to know about the release.
#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseDescriptor {
    /// Version string, e.g. "24.08"
    pub version: String,
    /// Direct download URL of the installer package
    pub download_url: String,
    /// Target architecture, e.g. "x64"
    pub architecture: String,
}

/// Information about a GitHub release.
/// Only the fields we use; serde ignores the rest.
#[derive(Debug, Clone, Deserialize)]
pub struct GitHubRelease {
    /// The release tag, e.g. "24.08" or "v1.2.0"
    pub tag_name: String,

    /// Downloadable files attached to this release
    #[serde(default)]
    pub assets: Vec<GitHubAsset>,
}

/// A single downloadable file in a GitHub release.
#[derive(Debug, Clone, Deserialize)]
pub struct GitHubAsset {
    /// The filename, e.g. "7z2408-x64.msi"
    pub name: String,

    /// Direct download URL (no auth needed for public repos)
    pub browser_download_url: String,

    /// File size in bytes
    #[serde(default)]
    pub size: u64,
}

/// Where a product's release comes from.
#[derive(Debug, Clone)]
pub enum ReleaseSource {
    /// Latest release from a release index, asset picked by suffix
    GitHubLatest {
        api_url: String,
        asset_suffix: String,
        architecture: String,
    },
    /// Operator-pinned version. `url_template` may contain
    /// `{version}` and `{arch}` placeholders.
    Pinned {
        version: String,
        url_template: String,
        architecture: String,
    },
}

// ============================================
// RELEASE INDEX
// ============================================

/// Something that can report the latest release of a project.
pub trait ReleaseIndex {
    fn latest_release(&self, api_url: &str) -> Result<GitHubRelease, StepError>;
}

/// The GitHub REST API, e.g.
/// https://api.github.com/repos/ip7z/7zip/releases/latest
pub struct GitHubReleases {
    timeout: Duration,
}

impl GitHubReleases {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ReleaseIndex for GitHubReleases {
    fn latest_release(&self, api_url: &str) -> Result<GitHubRelease, StepError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("avdprep/", env!("CARGO_PKG_VERSION")))
            .timeout(self.timeout)
            .build()
            .map_err(|e| StepError::ReleaseIndex(format!("failed to create HTTP client: {}", e)))?;

        debug!(url = %api_url, "querying release index");

        let response = client
            .get(api_url)
            .header("Accept", "application/vnd.github.v3+json")
            .send()
            .map_err(|e| StepError::ReleaseIndex(format!("could not reach {}: {}", api_url, e)))?;

        // 404 = no releases yet, 403 = rate limited, etc.
        if !response.status().is_success() {
            return Err(StepError::ReleaseIndex(format!(
                "{} returned status {}",
                api_url,
                response.status()
            )));
        }

        // Read as text and parse ourselves; keeps the reqwest "json"
        // feature out of the build.
        let body = response
            .text()
            .map_err(|e| StepError::ReleaseIndex(format!("failed to read response: {}", e)))?;

        parse_release(&body)
    }
}

/// Parse the JSON body of a GitHub release.
pub fn parse_release(body: &str) -> Result<GitHubRelease, StepError> {
    serde_json::from_str(body)
        .map_err(|e| StepError::ReleaseIndex(format!("failed to parse release info: {}", e)))
}

// ============================================
// RESOLVE
// ============================================

/// Produce a release descriptor. Never touches the target machine.
///
/// The index is only consulted for `ReleaseSource::GitHubLatest`.
pub fn resolve(
    source: &ReleaseSource,
    index: &dyn ReleaseIndex,
) -> Result<ReleaseDescriptor, StepError> {
    let descriptor = match source {
        ReleaseSource::GitHubLatest {
            api_url,
            asset_suffix,
            architecture,
        } => {
            let release = index.latest_release(api_url)?;
            let asset = select_asset(&release, asset_suffix)?;
            debug!("selected asset {} ({} bytes)", asset.name, asset.size);
            ReleaseDescriptor {
                version: version_from_tag(&release.tag_name),
                download_url: asset.browser_download_url.clone(),
                architecture: architecture.clone(),
            }
        }
        ReleaseSource::Pinned {
            version,
            url_template,
            architecture,
        } => ReleaseDescriptor {
            version: version.trim().to_string(),
            download_url: url_template
                .replace("{version}", version.trim())
                .replace("{arch}", architecture),
            architecture: architecture.clone(),
        },
    };

    if !is_dotted_version(&descriptor.version) {
        return Err(StepError::InvalidVersion {
            version: descriptor.version,
        });
    }

    Ok(descriptor)
}

/// Pick the asset whose name ends with `suffix` (case-insensitive).
pub fn select_asset<'a>(
    release: &'a GitHubRelease,
    suffix: &str,
) -> Result<&'a GitHubAsset, StepError> {
    let suffix_lower = suffix.to_lowercase();
    release
        .assets
        .iter()
        .find(|a| a.name.to_lowercase().ends_with(&suffix_lower))
        .ok_or_else(|| StepError::NoMatchingAsset {
            suffix: suffix.to_string(),
            available: if release.assets.is_empty() {
                "none".to_string()
            } else {
                release
                    .assets
                    .iter()
                    .map(|a| a.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            },
        })
}

/// Strip the "v" prefix from a tag ("v1.2.0" -> "1.2.0").
pub fn version_from_tag(tag: &str) -> String {
    let tag = tag.trim();
    tag.strip_prefix('v')
        .or_else(|| tag.strip_prefix('V'))
        .unwrap_or(tag)
        .to_string()
}

// ============================================
// TESTS
// ============================================
