// ============================================
// products.rs - The software this tool installs
// ============================================
// Each product is one instantiation of the provisioning pipeline:
// where its release comes from, what the package is called on disk,
// which MSI properties to pass, and how to recognise it afterwards.
//
//   7-Zip     latest GitHub release   registry match: major.minor
//   Zoom VDI  pinned vendor version   registry match: exact
// ============================================

use anyhow::{Context, Result};

use crate::config::{SevenZipConfig, ZoomVdiConfig};
use crate::registry::NamePattern;
use crate::release::ReleaseSource;
use crate::version::VersionPolicy;

/// Everything the pipeline needs to know about one product.
#[derive(Debug, Clone)]
pub struct Product {
    /// Short ID used for folder and log names (e.g. "7zip")
    pub id: String,
    /// Human-readable name for log output
    pub display_name: String,
    /// Where the release descriptor comes from
    pub source: ReleaseSource,
    /// Filename of the downloaded package inside the scratch folder
    pub artifact_name: String,
    /// MSI public properties, in order
    pub installer_properties: Vec<(String, String)>,
    /// How the product appears in the Uninstall registry
    pub name_pattern: NamePattern,
    pub version_policy: VersionPolicy,
}

// ============================================
// 7-ZIP
// ============================================

pub fn seven_zip(config: &SevenZipConfig) -> Result<Product> {
    let mut installer_properties = Vec::new();
    if let Some(path) = &config.install_path {
        installer_properties.push(("INSTALLDIR".to_string(), path.display().to_string()));
    }

    Ok(Product {
        id: "7zip".to_string(),
        display_name: "7-Zip".to_string(),
        source: ReleaseSource::GitHubLatest {
            api_url: config.release_api_url.clone(),
            asset_suffix: config.asset_suffix.clone(),
            architecture: config.architecture.clone(),
        },
        artifact_name: "7zip.msi".to_string(),
        installer_properties,
        name_pattern: NamePattern::new(&config.display_name)
            .with_context(|| format!("Invalid display name pattern '{}'", config.display_name))?,
        version_policy: config.version_policy,
    })
}

// ============================================
// ZOOM VDI
// ============================================

/// Download URL template for the Zoom VDI client MSI.
pub fn zoom_url_template(download_base: &str) -> String {
    format!(
        "{}/{{version}}/ZoomInstallerVDI.msi?archType={{arch}}",
        download_base.trim_end_matches('/')
    )
}

pub fn zoom_vdi(config: &ZoomVdiConfig) -> Result<Product> {
    let version = config
        .version
        .clone()
        .context("Zoom VDI needs a version to install (--pinned-version or [zoom_vdi] version)")?;

    let mut installer_properties = Vec::new();
    if config.no_desktop_shortcut {
        installer_properties.push(("ZNoDesktopShortCut".to_string(), "true".to_string()));
    }
    if let Some(host) = config.sso_host.as_deref().filter(|h| !h.trim().is_empty()) {
        installer_properties.push(("ZSSOHOST".to_string(), host.trim().to_string()));
    }

    Ok(Product {
        id: "zoom-vdi".to_string(),
        display_name: "Zoom VDI".to_string(),
        source: ReleaseSource::Pinned {
            version,
            url_template: zoom_url_template(&config.download_base),
            architecture: config.architecture.clone(),
        },
        artifact_name: "ZoomInstallerVDI.msi".to_string(),
        installer_properties,
        name_pattern: NamePattern::new(&config.display_name)
            .with_context(|| format!("Invalid display name pattern '{}'", config.display_name))?,
        version_policy: config.version_policy,
    })
}

// ============================================
// TESTS
// ============================================
