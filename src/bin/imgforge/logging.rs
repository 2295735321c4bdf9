//! Tracing setup for the binary.
//!
//! Two layers: the console (stderr) at the level picked by `-v`/`-q`, and
//! optionally a per-run log file that always records debug detail.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use imgforge::util::fs::ensure_dir;

/// Console filter directive for the given flags.
fn console_directive(verbose: u8, quiet: bool) -> &'static str {
    match (quiet, verbose) {
        (true, _) => "imgforge=error",
        (false, 0) => "imgforge=warn",
        (false, 1) => "imgforge=info",
        (false, _) => "imgforge=debug",
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the console level.
///
/// With a `log_dir`, returns the path of the log file created for this run.
/// A log file that cannot be created is reported and the run continues with
/// console output only.
pub fn init(verbose: u8, quiet: bool, color: bool, log_dir: Option<&Path>) -> Option<PathBuf> {
    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_directive(verbose, quiet)));
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(color)
        .without_time()
        .with_filter(console_filter);

    let mut failure = None;
    let log_file = log_dir.and_then(|dir| match create_log_file(dir) {
        Ok(created) => Some(created),
        Err(e) => {
            failure = Some(e);
            None
        }
    });

    let path = log_file.as_ref().map(|(path, _)| path.clone());
    let file_layer = log_file.map(|(_, file)| {
        fmt::layer()
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .with_filter(EnvFilter::new("imgforge=debug"))
    });

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .init();

    if let Some(e) = failure {
        tracing::warn!("no log file for this run: {:#}", e);
    }
    if let Some(path) = &path {
        tracing::debug!("logging to {}", path.display());
    }
    path
}

fn create_log_file(dir: &Path) -> Result<(PathBuf, File)> {
    ensure_dir(dir)?;
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let path = dir.join(format!("imgforge-{}.log", secs));
    let file = File::options()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    Ok((path, file))
}
