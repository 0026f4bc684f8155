// ============================================
// pipeline.rs - The provisioning step runner
// ============================================
// Runs one product through five stages, in order:
//
//   [1/5] Resolve  - which version, which URL
//   [2/5] Acquire  - download the MSI into a scratch folder
//   [3/5] Apply    - msiexec /i ... /qn /norestart
//   [4/5] Verify   - check the Uninstall registry for the right version
//   [5/5] Reclaim  - delete the scratch folder, prune old logs
//
// A failure in stages 1-4 stops the run immediately and Reclaim does
// NOT run. The scratch folder is kept on disk for diagnosis unless
// `cleanup_on_failure` is set. Reclaim itself can never fail a run.
//
// All machine access goes through the `Collaborators` traits, so the
// whole pipeline can be driven by fakes in tests.
// ============================================

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};

use crate::config::RunConfig;
use crate::download::{self, format_size, Transport};
use crate::error::{Stage, StepError};
use crate::installer::{self, InstallRequest, InstallerInvoker};
use crate::products::Product;
use crate::reclaim::{self, LogRetention, ReclaimReport, ScratchDir};
use crate::registry::{self, InstalledRecord, InstalledSoftware};
use crate::release::{self, ReleaseIndex};

// ============================================
// COLLABORATORS
// ============================================

/// The outside world, as seen by the pipeline.
pub struct Collaborators<'a> {
    pub release_index: &'a dyn ReleaseIndex,
    pub transport: &'a dyn Transport,
    pub installer: &'a dyn InstallerInvoker,
    pub software: &'a dyn InstalledSoftware,
}

// ============================================
// RESULTS
// ============================================

/// Summary of a successful run.
#[derive(Debug)]
pub struct RunReport {
    pub product: String,
    pub version: String,
    pub artifact_size: u64,
    pub install_log: PathBuf,
    pub installed: InstalledRecord,
    pub reclaim: ReclaimReport,
}

/// A run that stopped in one of the first four stages.
#[derive(Debug)]
pub struct StepFailure {
    pub error: StepError,
    /// Scratch folder left on disk, if any
    pub scratch_dir: Option<PathBuf>,
    /// Downloaded package left on disk, if any
    pub artifact: Option<PathBuf>,
}

impl StepFailure {
    pub fn stage(&self) -> Stage {
        self.error.stage()
    }

    pub fn exit_code(&self) -> u8 {
        self.error.exit_code()
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed ({}): {}",
            self.stage(),
            self.stage().error_kind(),
            self.error
        )
    }
}

/// Process exit code for a finished run: 0 only when every stage passed.
pub fn exit_code(result: &Result<RunReport, StepFailure>) -> u8 {
    match result {
        Ok(_) => 0,
        Err(failure) => failure.exit_code(),
    }
}

// ============================================
// RUN
// ============================================

/// Run every stage for `product`.
pub fn run(
    product: &Product,
    config: &RunConfig,
    deps: &Collaborators,
) -> Result<RunReport, StepFailure> {
    info!("Provisioning {}", product.display_name);

    // --- [1/5] Resolve ---
    progress(Stage::Resolve, "resolving release");
    let release = release::resolve(&product.source, deps.release_index)
        .map_err(|e| fail(e, None, None))?;
    info!(
        "Resolved {} {} ({}) from {}",
        product.display_name, release.version, release.architecture, release.download_url
    );

    // --- [2/5] Acquire ---
    progress(Stage::Acquire, "downloading installer");
    let scratch = ScratchDir::create(&config.work_dir, &product.id).map_err(|source| {
        fail(
            StepError::DownloadDir {
                path: config.work_dir.clone(),
                source,
            },
            None,
            None,
        )
    })?;

    let artifact = match download::acquire(
        deps.transport,
        &release,
        scratch.path(),
        &product.artifact_name,
    ) {
        Ok(a) => a,
        Err(e) => {
            let partial = scratch.path().join(&product.artifact_name);
            let partial = partial.exists().then_some(partial);
            return Err(abandon(scratch, partial, e, config));
        }
    };

    // --- [3/5] Apply ---
    progress(Stage::Apply, "running silent install");
    if let Err(source) = fs::create_dir_all(&config.log_dir) {
        let e = StepError::LogDir {
            path: config.log_dir.clone(),
            source,
        };
        return Err(abandon(scratch, Some(artifact.path), e, config));
    }

    let request = InstallRequest {
        package: artifact.path.clone(),
        log_path: install_log_path(config, product),
        properties: product.installer_properties.clone(),
        timeout: config.install_timeout(),
    };
    let outcome = match installer::apply(deps.installer, &request) {
        Ok(o) => o,
        Err(e) => return Err(abandon(scratch, Some(artifact.path), e, config)),
    };
    info!("Installer finished with exit code {}", outcome.exit_code);

    // --- [4/5] Verify ---
    progress(Stage::Verify, "checking installed software");
    let installed = match registry::verify(
        deps.software,
        &product.name_pattern,
        &artifact.expected_version,
        product.version_policy,
    ) {
        Ok(r) => r,
        Err(e) => return Err(abandon(scratch, Some(artifact.path), e, config)),
    };

    // --- [5/5] Reclaim ---
    progress(Stage::Reclaim, "cleaning up");
    let retention = LogRetention {
        log_dir: config.log_dir.clone(),
        retention_days: config.log_retention_days,
    };
    let reclaim = reclaim::reclaim(scratch, &retention, config.no_cleanup, SystemTime::now());
    if reclaim.skipped {
        info!("Cleanup skipped (no_cleanup is set)");
    } else {
        info!(
            "Removed scratch folder, pruned {} log file(s), {} warning(s)",
            reclaim.pruned_logs.len(),
            reclaim.warnings.len()
        );
    }

    info!(
        "{} {} installed ({} downloaded, log: {})",
        product.display_name,
        installed.display_version,
        format_size(artifact.size),
        outcome.log_path.display()
    );

    Ok(RunReport {
        product: product.id.clone(),
        version: release.version,
        artifact_size: artifact.size,
        install_log: outcome.log_path,
        installed,
        reclaim,
    })
}

// ============================================
// HELPERS
// ============================================

fn progress(stage: Stage, what: &str) {
    info!("[{}/{}] {}: {}", stage.position(), Stage::ALL.len(), stage, what);
}

/// Log a fatal stage error and wrap it.
fn fail(error: StepError, scratch_dir: Option<PathBuf>, artifact: Option<PathBuf>) -> StepFailure {
    let failure = StepFailure {
        error,
        scratch_dir,
        artifact,
    };
    error!("[{}/{}] {}", failure.stage().position(), Stage::ALL.len(), failure);
    failure
}

/// Stop after a failure once the scratch folder exists.
/// Reclaim does not run; only the scratch folder may be removed, and
/// only when `cleanup_on_failure` asks for it.
fn abandon(
    scratch: ScratchDir,
    artifact: Option<PathBuf>,
    error: StepError,
    config: &RunConfig,
) -> StepFailure {
    if config.cleanup_on_failure && !config.no_cleanup {
        return match scratch.remove() {
            Ok(_) => fail(error, None, None),
            Err(w) => {
                warn!("CleanupWarning: {}", w);
                let dir = w.path;
                fail(error, Some(dir), artifact)
            }
        };
    }

    let dir = scratch.keep();
    if let Some(path) = &artifact {
        info!("Leaving {} on disk", path.display());
    }
    fail(error, Some(dir), artifact)
}

/// <log_dir>/<product>-install-<unix seconds>.log
fn install_log_path(config: &RunConfig, product: &Product) -> PathBuf {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    config
        .log_dir
        .join(format!("{}-install-{}.log", product.id, stamp))
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installer::InstallOutcome;
    use crate::registry::NamePattern;
    use crate::release::{GitHubAsset, GitHubRelease, ReleaseSource};
    use crate::version::VersionPolicy;
    use std::cell::{Cell, RefCell};
    use std::fs::File;
    use std::path::Path;
    use std::time::Duration;

    // --- fakes ---

    struct FakeIndex {
        release: Option<GitHubRelease>,
        calls: Cell<usize>,
    }

    impl ReleaseIndex for FakeIndex {
        fn latest_release(&self, _api_url: &str) -> Result<GitHubRelease, StepError> {
            self.calls.set(self.calls.get() + 1);
            self.release
                .clone()
                .ok_or_else(|| StepError::ReleaseIndex("index offline".to_string()))
        }
    }

    #[derive(Default)]
    struct FakeTransport {
        downloads: RefCell<Vec<(String, PathBuf)>>,
        fail: bool,
    }

    impl Transport for FakeTransport {
        fn download(&self, url: &str, dest: &Path) -> Result<u64, StepError> {
            self.downloads
                .borrow_mut()
                .push((url.to_string(), dest.to_path_buf()));
            fs::write(dest, b"partial").unwrap();
            if self.fail {
                return Err(StepError::Download {
                    url: url.to_string(),
                    reason: "connection reset".to_string(),
                });
            }
            fs::write(dest, b"MSI package").unwrap();
            Ok(11)
        }
    }

    struct FakeInstaller {
        exit_code: i32,
        requests: RefCell<Vec<InstallRequest>>,
    }

    impl InstallerInvoker for FakeInstaller {
        fn install(&self, request: &InstallRequest) -> Result<InstallOutcome, StepError> {
            assert!(request.package.exists(), "package must exist before install");
            self.requests.borrow_mut().push(request.clone());
            fs::write(&request.log_path, b"=== Verbose logging started ===").unwrap();
            Ok(InstallOutcome {
                exit_code: self.exit_code,
                log_path: request.log_path.clone(),
            })
        }
    }

    struct FakeRegistry {
        records: Vec<InstalledRecord>,
        queries: Cell<usize>,
    }

    impl InstalledSoftware for FakeRegistry {
        fn installed(&self) -> Result<Vec<InstalledRecord>, StepError> {
            self.queries.set(self.queries.get() + 1);
            Ok(self.records.clone())
        }
    }

    // --- fixtures ---

    struct World {
        index: FakeIndex,
        transport: FakeTransport,
        installer: FakeInstaller,
        registry: FakeRegistry,
    }

    impl World {
        fn new() -> Self {
            Self {
                index: FakeIndex {
                    release: Some(GitHubRelease {
                        tag_name: "24.08.0".to_string(),
                        assets: vec![
                            GitHubAsset {
                                name: "pkg-arm64.msi".to_string(),
                                browser_download_url: "https://example/pkg-arm64.msi".to_string(),
                                size: 0,
                            },
                            GitHubAsset {
                                name: "pkg-x64.msi".to_string(),
                                browser_download_url: "https://example/pkg-x64.msi".to_string(),
                                size: 0,
                            },
                        ],
                    }),
                    calls: Cell::new(0),
                },
                transport: FakeTransport::default(),
                installer: FakeInstaller {
                    exit_code: 0,
                    requests: RefCell::new(Vec::new()),
                },
                registry: FakeRegistry {
                    records: vec![
                        InstalledRecord::new("Microsoft Edge", "130.0.2849.80"),
                        InstalledRecord::new("Example Pkg", "24.08.0"),
                    ],
                    queries: Cell::new(0),
                },
            }
        }

        fn deps(&self) -> Collaborators<'_> {
            Collaborators {
                release_index: &self.index,
                transport: &self.transport,
                installer: &self.installer,
                software: &self.registry,
            }
        }
    }

    fn example_product() -> Product {
        Product {
            id: "pkg".to_string(),
            display_name: "Example Pkg".to_string(),
            source: ReleaseSource::GitHubLatest {
                api_url: "https://example/releases/latest".to_string(),
                asset_suffix: "-x64.msi".to_string(),
                architecture: "x64".to_string(),
            },
            artifact_name: "pkg.msi".to_string(),
            installer_properties: vec![("ALLUSERS".to_string(), "1".to_string())],
            name_pattern: NamePattern::new("Example Pkg*").unwrap(),
            version_policy: VersionPolicy::Exact,
        }
    }

    fn config(root: &Path) -> RunConfig {
        RunConfig {
            work_dir: root.join("temp"),
            log_dir: root.join("logs"),
            log_retention_days: 7,
            ..RunConfig::default()
        }
    }

    /// Put a month-old log in the log folder so pruning is observable.
    fn old_log(config: &RunConfig) -> PathBuf {
        fs::create_dir_all(&config.log_dir).unwrap();
        let path = config.log_dir.join("previous-run.log");
        let file = File::create(&path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(30 * 24 * 60 * 60))
            .unwrap();
        path
    }

    // --- end to end ---

    #[test]
    fn test_end_to_end_success() {
        let root = tempfile::tempdir().unwrap();
        let config = config(root.path());
        let stale_log = old_log(&config);
        let world = World::new();

        let result = run(&example_product(), &config, &world.deps());
        assert_eq!(exit_code(&result), 0);
        let report = result.unwrap();

        assert_eq!(report.version, "24.08.0");
        assert_eq!(report.installed, InstalledRecord::new("Example Pkg", "24.08.0"));
        assert_eq!(report.artifact_size, 11);

        // Acquire wrote <work_dir>/pkg-<id>/pkg.msi from the x64 asset
        let downloads = world.transport.downloads.borrow();
        assert_eq!(downloads.len(), 1);
        assert_eq!(downloads[0].0, "https://example/pkg-x64.msi");
        assert_eq!(downloads[0].1.file_name().unwrap(), "pkg.msi");
        assert!(downloads[0].1.starts_with(&config.work_dir));

        // Apply got the artifact, a log path and the product properties
        let requests = world.installer.requests.borrow();
        assert_eq!(requests[0].package, downloads[0].1);
        assert!(requests[0].log_path.starts_with(&config.log_dir));
        assert_eq!(requests[0].properties, vec![("ALLUSERS".to_string(), "1".to_string())]);

        // Reclaim removed the scratch folder and the stale log, kept this run's log
        assert!(!downloads[0].1.exists());
        assert!(!stale_log.exists());
        assert!(report.install_log.exists());
        assert_eq!(report.reclaim.pruned_logs, vec![stale_log]);
    }

    #[test]
    fn test_end_to_end_verification_failure_skips_reclaim() {
        let root = tempfile::tempdir().unwrap();
        let config = config(root.path());
        let stale_log = old_log(&config);
        let mut world = World::new();
        world.registry.records = vec![InstalledRecord::new("Microsoft Edge", "130.0")];

        let result = run(&example_product(), &config, &world.deps());
        assert_ne!(exit_code(&result), 0);

        let failure = result.unwrap_err();
        assert_eq!(failure.stage(), Stage::Verify);
        assert!(matches!(failure.error, StepError::NotInstalled { .. }));
        assert_eq!(failure.exit_code(), 5);

        // Reclaim did not run: artifact and old logs are still there
        let artifact = failure.artifact.expect("artifact path reported");
        assert!(artifact.exists());
        assert_eq!(fs::read(&artifact).unwrap(), b"MSI package");
        assert!(failure.scratch_dir.unwrap().exists());
        assert!(stale_log.exists());
    }

    #[test]
    fn test_version_mismatch_fails_verify() {
        let root = tempfile::tempdir().unwrap();
        let mut world = World::new();
        world.registry.records = vec![InstalledRecord::new("Example Pkg", "24.07.9")];

        let failure = run(&example_product(), &config(root.path()), &world.deps()).unwrap_err();
        assert!(matches!(failure.error, StepError::VersionMismatch { .. }));
    }

    // --- stage gating ---

    #[test]
    fn test_resolve_failure_downloads_nothing() {
        let root = tempfile::tempdir().unwrap();
        let mut product = example_product();
        product.source = ReleaseSource::GitHubLatest {
            api_url: "https://example/releases/latest".to_string(),
            asset_suffix: "-riscv.msi".to_string(),
            architecture: "riscv".to_string(),
        };
        let world = World::new();

        let failure = run(&product, &config(root.path()), &world.deps()).unwrap_err();

        assert_eq!(failure.stage(), Stage::Resolve);
        assert!(matches!(failure.error, StepError::NoMatchingAsset { .. }));
        assert!(world.transport.downloads.borrow().is_empty());
        assert!(world.installer.requests.borrow().is_empty());
        assert!(failure.scratch_dir.is_none());
    }

    #[test]
    fn test_index_offline_is_resolution_error() {
        let root = tempfile::tempdir().unwrap();
        let mut world = World::new();
        world.index.release = None;

        let failure = run(&example_product(), &config(root.path()), &world.deps()).unwrap_err();
        assert_eq!(failure.stage(), Stage::Resolve);
        assert_eq!(failure.exit_code(), 2);
        assert_eq!(world.index.calls.get(), 1);
    }

    #[test]
    fn test_download_failure_keeps_partial_file() {
        let root = tempfile::tempdir().unwrap();
        let mut world = World::new();
        world.transport.fail = true;

        let failure = run(&example_product(), &config(root.path()), &world.deps()).unwrap_err();

        assert_eq!(failure.stage(), Stage::Acquire);
        assert!(failure.artifact.unwrap().exists());
        assert!(world.installer.requests.borrow().is_empty());
    }

    #[test]
    fn test_nonzero_installer_exit_skips_verify() {
        for code in [1603, 3010] {
            let root = tempfile::tempdir().unwrap();
            let mut world = World::new();
            world.installer.exit_code = code;

            let failure = run(&example_product(), &config(root.path()), &world.deps()).unwrap_err();

            assert_eq!(failure.stage(), Stage::Apply);
            assert!(matches!(failure.error, StepError::InstallerExit { code: c, .. } if c == code));
            assert_eq!(world.registry.queries.get(), 0);
        }
    }

    // --- cleanup switches ---

    #[test]
    fn test_no_cleanup_deletes_nothing() {
        let root = tempfile::tempdir().unwrap();
        let mut config = config(root.path());
        config.no_cleanup = true;
        let stale_log = old_log(&config);
        let world = World::new();

        let report = run(&example_product(), &config, &world.deps()).unwrap();

        assert!(report.reclaim.skipped);
        assert!(world.transport.downloads.borrow()[0].1.exists());
        assert!(stale_log.exists());
    }

    #[test]
    fn test_cleanup_on_failure_removes_scratch() {
        let root = tempfile::tempdir().unwrap();
        let mut config = config(root.path());
        config.cleanup_on_failure = true;
        let stale_log = old_log(&config);
        let mut world = World::new();
        world.installer.exit_code = 1603;

        let failure = run(&example_product(), &config, &world.deps()).unwrap_err();

        // The original failure is still what gets reported
        assert_eq!(failure.stage(), Stage::Apply);
        assert!(failure.scratch_dir.is_none());
        assert!(failure.artifact.is_none());
        assert!(!world.transport.downloads.borrow()[0].1.exists());
        // Log pruning is part of Reclaim, which still does not run
        assert!(stale_log.exists());
    }

    #[test]
    fn test_failure_display_names_stage() {
        let failure = StepFailure {
            error: StepError::NotInstalled {
                pattern: "Example Pkg*".to_string(),
            },
            scratch_dir: None,
            artifact: None,
        };
        assert_eq!(
            failure.to_string(),
            "Verify failed (VerificationError): no installed product matches 'Example Pkg*'"
        );
    }
}
