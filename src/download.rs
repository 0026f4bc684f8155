// ============================================
// download.rs - Acquire stage
// ============================================
// Gets the installer package onto local disk.
//
// The HTTP part sits behind the `Transport` trait so the pipeline can
// be exercised without a network. The production transport streams the
// response body to disk in 8KB chunks.
// ============================================

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::StepError;
use crate::release::ReleaseDescriptor;

// ============================================
// DATA STRUCTURES
// ============================================

/// The downloaded installer package.
#[derive(Debug, Clone, PartialEq)]
pub struct InstallerArtifact {
    /// Where the package was written
    pub path: PathBuf,
    /// Version the package is expected to install
    pub expected_version: String,
    /// Bytes written
    pub size: u64,
}

// ============================================
// TRANSPORT
// ============================================

/// URL -> local file.
pub trait Transport {
    /// Download `url` into `dest`, returning the number of bytes written.
    fn download(&self, url: &str, dest: &Path) -> Result<u64, StepError>;
}

/// Blocking reqwest transport.
pub struct HttpTransport {
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Transport for HttpTransport {
    fn download(&self, url: &str, dest: &Path) -> Result<u64, StepError> {
        let fail = |reason: String| StepError::Download {
            url: url.to_string(),
            reason,
        };

        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("avdprep/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::limited(10))
            .timeout(self.timeout)
            .build()
            .map_err(|e| fail(format!("failed to create HTTP client: {}", e)))?;

        let response = client
            .get(url)
            .send()
            .map_err(|e| fail(format!("failed to connect to download server: {}", e)))?;

        debug!(status = %response.status(), final_url = %response.url(), "download response");

        check_status(url, response.status())?;

        // May be 0 if the server doesn't report it
        let total_size = response.content_length().unwrap_or(0);

        let mut file = File::create(dest)
            .map_err(|e| fail(format!("failed to create {}: {}", dest.display(), e)))?;

        let mut reader = response;
        let mut buffer = [0u8; 8192];
        let mut downloaded: u64 = 0;
        let mut last_reported = 0;

        loop {
            let bytes_read = reader
                .read(&mut buffer)
                .map_err(|e| fail(format!("error reading download data: {}", e)))?;
            if bytes_read == 0 {
                break;
            }
            file.write_all(&buffer[..bytes_read])
                .map_err(|e| fail(format!("error writing {}: {}", dest.display(), e)))?;

            downloaded += bytes_read as u64;
            if total_size > 0 {
                let percent = (downloaded * 100) / total_size;
                if percent >= last_reported + 10 {
                    last_reported = percent - percent % 10;
                    debug!("downloaded {}% of {}", last_reported, format_size(total_size));
                }
            }
        }

        // Flush and close before msiexec opens the file
        file.flush()
            .map_err(|e| fail(format!("error flushing {}: {}", dest.display(), e)))?;
        drop(file);

        Ok(downloaded)
    }
}

/// Anything but 2xx is an acquisition failure.
pub fn check_status(url: &str, status: reqwest::StatusCode) -> Result<(), StepError> {
    if status.is_success() {
        return Ok(());
    }
    Err(StepError::Download {
        url: url.to_string(),
        reason: format!("server returned status {}", status),
    })
}

// ============================================
// ACQUIRE
// ============================================

/// Download the release into `dest_dir/artifact_name`.
///
/// `dest_dir` is created if missing. It is fine if it already exists,
/// so calling this twice against the same directory works.
pub fn acquire(
    transport: &dyn Transport,
    release: &ReleaseDescriptor,
    dest_dir: &Path,
    artifact_name: &str,
) -> Result<InstallerArtifact, StepError> {
    fs::create_dir_all(dest_dir).map_err(|source| StepError::DownloadDir {
        path: dest_dir.to_path_buf(),
        source,
    })?;

    let path = dest_dir.join(artifact_name);
    info!("Downloading {} to {}", release.download_url, path.display());

    let size = transport.download(&release.download_url, &path)?;
    info!("Download complete ({})", format_size(size));

    Ok(InstallerArtifact {
        path,
        expected_version: release.version.clone(),
        size,
    })
}

// ============================================
// FILE SIZE FORMATTING
// ============================================

/// Format a byte count as a human-readable size string.
///
/// Examples:
///   format_size(9_000_000) => "8.6 MB"
///   format_size(512_000)   => "500 KB"
pub fn format_size(bytes: u64) -> String {
    if bytes >= 1_073_741_824 {
        format!("{:.1} GB", bytes as f64 / 1_073_741_824.0)
    } else if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.0} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} bytes", bytes)
    }
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Writes a fixed payload and remembers every URL it was asked for.
    struct MemoryTransport {
        payload: &'static [u8],
        requests: RefCell<Vec<String>>,
    }

    impl Transport for MemoryTransport {
        fn download(&self, url: &str, dest: &Path) -> Result<u64, StepError> {
            self.requests.borrow_mut().push(url.to_string());
            fs::write(dest, self.payload).map_err(|e| StepError::Download {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
            Ok(self.payload.len() as u64)
        }
    }

    struct FailingTransport;

    impl Transport for FailingTransport {
        fn download(&self, url: &str, _dest: &Path) -> Result<u64, StepError> {
            Err(StepError::Download {
                url: url.to_string(),
                reason: "connection reset".to_string(),
            })
        }
    }

    #[test]
    fn test_check_status() {
        let url = "https://example/pkg-x64.msi";
        assert!(check_status(url, reqwest::StatusCode::OK).is_ok());

        for status in [reqwest::StatusCode::NOT_FOUND, reqwest::StatusCode::FORBIDDEN] {
            let err = check_status(url, status).unwrap_err();
            assert_eq!(err.stage(), crate::error::Stage::Acquire);
            assert!(err.to_string().contains(&status.as_u16().to_string()), "{err}");
        }
    }

    fn release() -> ReleaseDescriptor {
        ReleaseDescriptor {
            version: "24.08.0".to_string(),
            download_url: "https://example/pkg-x64.msi".to_string(),
            architecture: "x64".to_string(),
        }
    }

    #[test]
    fn test_acquire_writes_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport {
            payload: b"MSI",
            requests: RefCell::new(Vec::new()),
        };

        let dest = dir.path().join("temp");
        let artifact = acquire(&transport, &release(), &dest, "pkg.msi").unwrap();

        assert_eq!(artifact.path, dest.join("pkg.msi"));
        assert_eq!(artifact.expected_version, "24.08.0");
        assert_eq!(artifact.size, 3);
        assert_eq!(fs::read(&artifact.path).unwrap(), b"MSI");
        assert_eq!(*transport.requests.borrow(), vec!["https://example/pkg-x64.msi"]);
    }

    #[test]
    fn test_acquire_twice_on_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport {
            payload: b"MSI",
            requests: RefCell::new(Vec::new()),
        };

        let dest = dir.path().join("nested").join("temp");
        acquire(&transport, &release(), &dest, "pkg.msi").unwrap();
        acquire(&transport, &release(), &dest, "pkg.msi").unwrap();

        assert_eq!(transport.requests.borrow().len(), 2);
    }

    #[test]
    fn test_acquire_propagates_transport_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = acquire(&FailingTransport, &release(), dir.path(), "pkg.msi").unwrap_err();
        assert_eq!(err.stage(), crate::error::Stage::Acquire);
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn test_acquire_fails_when_directory_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("temp");
        fs::write(&blocker, b"not a dir").unwrap();

        let transport = MemoryTransport {
            payload: b"MSI",
            requests: RefCell::new(Vec::new()),
        };
        let err = acquire(&transport, &release(), &blocker, "pkg.msi").unwrap_err();

        assert!(matches!(err, StepError::DownloadDir { .. }));
        assert!(transport.requests.borrow().is_empty());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 bytes");
        assert_eq!(format_size(500), "500 bytes");
        assert_eq!(format_size(1024), "1 KB");
        assert_eq!(format_size(1_048_576), "1.0 MB");
        assert_eq!(format_size(9_000_000), "8.6 MB");
        assert_eq!(format_size(1_073_741_824), "1.0 GB");
    }
}
