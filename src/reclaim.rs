// ============================================
// reclaim.rs - Reclaim stage
// ============================================
// Best-effort cleanup after a run:
//   1. Delete the scratch folder that held the downloaded package
//   2. Prune *.log files older than the retention window
//
// Nothing in here can fail a run. Every problem becomes a
// CleanupWarning that the caller logs.
//
// The scratch folder is a guard: if it is dropped without being kept,
// it deletes itself. The pipeline decides whether to keep it after a
// failure (so the package stays around for diagnosis) or let it go.
// ============================================

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::CleanupWarning;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

// ============================================
// SCRATCH DIRECTORY
// ============================================

/// A per-run download folder that removes itself when dropped.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
    armed: bool,
}

impl ScratchDir {
    /// Create `<parent>/<prefix>-<random>` (and `parent` if needed).
    pub fn create(parent: &Path, prefix: &str) -> std::io::Result<Self> {
        let path = parent.join(format!("{}-{}", prefix, uuid::Uuid::new_v4().simple()));
        fs::create_dir_all(&path)?;
        Ok(Self { path, armed: true })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the folder on disk and hand back its path.
    pub fn keep(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }

    /// Delete the folder now, reporting a warning instead of failing.
    pub fn remove(mut self) -> Result<PathBuf, CleanupWarning> {
        self.armed = false;
        let path = std::mem::take(&mut self.path);
        match fs::remove_dir_all(&path) {
            Ok(()) => Ok(path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(path),
            Err(e) => Err(CleanupWarning::new(path, e)),
        }
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = fs::remove_dir_all(&self.path) {
                debug!("scratch folder {} not removed: {}", self.path.display(), e);
            }
        }
    }
}

// ============================================
// LOG PRUNING
// ============================================

/// Which log files to prune and how old they must be.
#[derive(Debug, Clone)]
pub struct LogRetention {
    pub log_dir: PathBuf,
    pub retention_days: u64,
}

impl LogRetention {
    /// Saturates instead of overflowing for absurd day counts.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.retention_days.saturating_mul(SECONDS_PER_DAY))
    }
}

/// Is a file last written at `modified` past the retention window?
///
/// Strictly older only: a file exactly `window` old is kept.
/// A timestamp in the future is never expired.
pub fn is_expired(modified: SystemTime, now: SystemTime, window: Duration) -> bool {
    match now.duration_since(modified) {
        Ok(age) => age > window,
        Err(_) => false,
    }
}

/// Delete `*.log` files directly inside `log_dir` whose last-write time
/// is strictly older than the window. Subfolders are left alone.
pub fn prune_logs(
    retention: &LogRetention,
    now: SystemTime,
) -> (Vec<PathBuf>, Vec<CleanupWarning>) {
    let mut removed = Vec::new();
    let mut warnings = Vec::new();

    if !retention.log_dir.exists() {
        return (removed, warnings);
    }

    let window = retention.window();

    for entry in WalkDir::new(&retention.log_dir).min_depth(1).max_depth(1) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                let path = e
                    .path()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| retention.log_dir.clone());
                warnings.push(CleanupWarning::new(path, e));
                continue;
            }
        };

        if !entry.file_type().is_file() || !is_log_file(entry.path()) {
            continue;
        }

        let modified = match entry
            .metadata()
            .map_err(|e| e.to_string())
            .and_then(|m| m.modified().map_err(|e| e.to_string()))
        {
            Ok(t) => t,
            Err(e) => {
                warnings.push(CleanupWarning::new(entry.path(), e));
                continue;
            }
        };

        if !is_expired(modified, now, window) {
            continue;
        }

        match fs::remove_file(entry.path()) {
            Ok(()) => removed.push(entry.path().to_path_buf()),
            Err(e) => warnings.push(CleanupWarning::new(entry.path(), e)),
        }
    }

    (removed, warnings)
}

fn is_log_file(path: &Path) -> bool {
    path.extension()
        .map(|e| e.eq_ignore_ascii_case("log"))
        .unwrap_or(false)
}

// ============================================
// RECLAIM
// ============================================

/// What Reclaim did.
#[derive(Debug, Default)]
pub struct ReclaimReport {
    /// True when cleanup was suppressed and nothing was touched
    pub skipped: bool,
    /// Scratch folder that was deleted, if any
    pub removed_scratch: Option<PathBuf>,
    /// Log files that were pruned
    pub pruned_logs: Vec<PathBuf>,
    /// Everything that could not be deleted
    pub warnings: Vec<CleanupWarning>,
}

/// Run the Reclaim stage.
///
/// With `suppress` set nothing is deleted: the scratch folder is kept
/// and no logs are pruned.
pub fn reclaim(
    scratch: ScratchDir,
    retention: &LogRetention,
    suppress: bool,
    now: SystemTime,
) -> ReclaimReport {
    if suppress {
        let kept = scratch.keep();
        debug!("cleanup suppressed, keeping {}", kept.display());
        return ReclaimReport {
            skipped: true,
            ..ReclaimReport::default()
        };
    }

    let mut report = ReclaimReport::default();

    match scratch.remove() {
        Ok(path) => report.removed_scratch = Some(path),
        Err(w) => report.warnings.push(w),
    }

    let (pruned, warnings) = prune_logs(retention, now);
    report.pruned_logs = pruned;
    report.warnings.extend(warnings);

    for w in &report.warnings {
        warn!("CleanupWarning: {}", w);
    }

    report
}

// ============================================
// TESTS
// ============================================
