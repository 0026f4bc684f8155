// ============================================
// avdprep - main.rs
// ============================================
// Entry point. Parses the command line, loads configuration, wires the
// real collaborators (GitHub, HTTP, msiexec, registry) into the
// pipeline, and turns the outcome into a process exit code.
//
// Exit codes:
//   0  every stage passed
//   1  bad configuration or command line
//   2  Resolve failed
//   3  Acquire failed
//   4  Apply failed
//   5  Verify failed
// ============================================

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod download;
mod error;
mod installer;
mod pipeline;
mod products;
mod reclaim;
mod registry;
mod release;
mod version;

use config::RunConfig;
use download::HttpTransport;
use installer::Msiexec;
use pipeline::Collaborators;
use registry::UninstallRegistry;
use release::GitHubReleases;

// ============================================
// COMMAND LINE
// ============================================

#[derive(Parser, Debug)]
#[command(
    name = "avdprep",
    version,
    about = "Unattended software installs for Azure Virtual Desktop image builds"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// TOML config file; flags override its values
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Parent folder for per-run download folders
    #[arg(long, global = true, value_name = "PATH")]
    work_dir: Option<PathBuf>,

    /// Folder for installer logs
    #[arg(long, global = true, value_name = "PATH")]
    log_dir: Option<PathBuf>,

    /// Delete logs older than this many days
    #[arg(long, global = true, value_name = "DAYS")]
    log_retention_days: Option<u64>,

    /// Skip cleanup entirely (keep the download and all logs)
    #[arg(long, global = true)]
    no_cleanup: bool,

    /// Delete the download folder even when the run fails
    #[arg(long, global = true, conflicts_with = "no_cleanup")]
    cleanup_on_failure: bool,

    /// Kill msiexec after this many seconds (0 = wait forever)
    #[arg(long, global = true, value_name = "SECS")]
    install_timeout: Option<u64>,

    /// Debug-level logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Install the latest 7-Zip release from GitHub
    SevenZip {
        /// Install into this folder instead of the MSI default
        #[arg(long, value_name = "PATH")]
        install_path: Option<PathBuf>,
    },

    /// Install a pinned version of the Zoom VDI client
    ZoomVdi {
        /// Version to install, e.g. 6.2.10
        #[arg(long, value_name = "VERSION")]
        pinned_version: Option<String>,

        /// Company SSO host to pre-seed
        #[arg(long, value_name = "HOST")]
        sso_host: Option<String>,

        /// Base URL the versioned MSI is downloaded from
        #[arg(long, value_name = "URL")]
        download_base: Option<String>,
    },

    /// Print the effective configuration as TOML
    ShowConfig,
}

// ============================================
// MAIN FUNCTION
// ============================================

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(1)
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(filter)
        .init();
}

fn run(cli: Cli) -> Result<u8> {
    let mut config = RunConfig::load(cli.config.as_deref())?;
    apply_global_flags(&mut config, &cli);

    let product = match cli.command {
        Command::SevenZip { install_path } => {
            if install_path.is_some() {
                config.seven_zip.install_path = install_path;
            }
            products::seven_zip(&config.seven_zip)?
        }
        Command::ZoomVdi {
            pinned_version,
            sso_host,
            download_base,
        } => {
            if pinned_version.is_some() {
                config.zoom_vdi.version = pinned_version;
            }
            if sso_host.is_some() {
                config.zoom_vdi.sso_host = sso_host;
            }
            if let Some(base) = download_base {
                config.zoom_vdi.download_base = base;
            }
            products::zoom_vdi(&config.zoom_vdi)?
        }
        Command::ShowConfig => {
            print!("{}", config.to_toml()?);
            return Ok(0);
        }
    };

    info!("avdprep v{}", env!("CARGO_PKG_VERSION"));
    info!("Work folder: {}", config.work_dir.display());
    info!("Log folder: {}", config.log_dir.display());

    let release_index = GitHubReleases::new(config.metadata_timeout());
    let transport = HttpTransport::new(config.download_timeout());
    let installer = Msiexec::new();
    let software = UninstallRegistry;

    let deps = Collaborators {
        release_index: &release_index,
        transport: &transport,
        installer: &installer,
        software: &software,
    };

    let result = pipeline::run(&product, &config, &deps);
    let code = pipeline::exit_code(&result);
    match &result {
        Ok(report) => info!(
            "Done: {} {} verified as '{}' {} ({} bytes, log {}, {} old log(s) pruned)",
            report.product,
            report.version,
            report.installed.display_name,
            report.installed.display_version,
            report.artifact_size,
            report.install_log.display(),
            report.reclaim.pruned_logs.len()
        ),
        Err(failure) => error!("{} exiting with code {}", failure, code),
    }
    Ok(code)
}

/// Command line flags win over the config file.
fn apply_global_flags(config: &mut RunConfig, cli: &Cli) {
    if let Some(dir) = &cli.work_dir {
        config.work_dir = dir.clone();
    }
    if let Some(dir) = &cli.log_dir {
        config.log_dir = dir.clone();
    }
    if let Some(days) = cli.log_retention_days {
        config.log_retention_days = days;
    }
    if cli.no_cleanup {
        config.no_cleanup = true;
    }
    if cli.cleanup_on_failure {
        config.cleanup_on_failure = true;
    }
    if let Some(secs) = cli.install_timeout {
        config.install_timeout_secs = secs;
    }
}

// ============================================
// TESTS
// ============================================
