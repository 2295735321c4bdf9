//! Host health checks.
//!
//! The `doctor` command performs fast checks to verify that the tools the
//! pipeline drives are installed and the local directories are usable,
//! without touching any VM.
//!
//! ## Checks Performed
//!
//! - `qm` (Proxmox VE control plane)
//! - `virt-sysprep` and `virt-customize` (libguestfs)
//! - Cache, state, work and log directories are writable
//! - The catalog loads and validates

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::core::catalog::Catalog;
use crate::util::context::Settings;
use crate::util::fs::ensure_dir;
use crate::util::process::{find_executable, ProcessBuilder};

/// Result of a single health check.
#[derive(Debug, Clone)]
pub struct CheckResult {
    /// Name of the check
    pub name: String,

    /// Whether the check passed
    pub passed: bool,

    /// Human-readable status message
    pub message: String,

    /// Path to the tool or directory (if applicable)
    pub path: Option<PathBuf>,

    /// Version string (if applicable)
    pub version: Option<String>,

    /// How long the check took
    pub duration: Duration,

    /// Whether this check is required or optional
    pub required: bool,
}

impl CheckResult {
    pub fn pass(name: impl Into<String>, message: impl Into<String>) -> Self {
        CheckResult {
            name: name.into(),
            passed: true,
            message: message.into(),
            path: None,
            version: None,
            duration: Duration::ZERO,
            required: true,
        }
    }

    pub fn fail(name: impl Into<String>, message: impl Into<String>) -> Self {
        CheckResult {
            passed: false,
            ..CheckResult::pass(name, message)
        }
    }

    /// Mark this check as optional.
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_path(mut self, path: PathBuf) -> Self {
        self.path = Some(path);
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }
}

/// Summary of all health checks.
#[derive(Debug, Clone, Default)]
pub struct DoctorReport {
    pub checks: Vec<CheckResult>,

    /// Total time taken
    pub total_duration: Duration,

    /// Environment information
    pub environment: BTreeMap<String, String>,
}

impl DoctorReport {
    pub fn add(&mut self, check: CheckResult) {
        self.checks.push(check);
    }

    /// Check if all required checks passed.
    pub fn all_required_passed(&self) -> bool {
        self.checks.iter().filter(|c| c.required).all(|c| c.passed)
    }

    pub fn passed_count(&self) -> usize {
        self.checks.iter().filter(|c| c.passed).count()
    }

    pub fn failed_count(&self) -> usize {
        self.checks.len() - self.passed_count()
    }

    pub fn required_failed_count(&self) -> usize {
        self.checks
            .iter()
            .filter(|c| c.required && !c.passed)
            .count()
    }
}

/// Run every check against the resolved settings.
pub fn doctor(settings: &Settings) -> DoctorReport {
    let start = Instant::now();
    let mut report = DoctorReport::default();

    report
        .environment
        .insert("os".to_string(), std::env::consts::OS.to_string());
    report
        .environment
        .insert("arch".to_string(), std::env::consts::ARCH.to_string());

    report.add(check_tool("qm", &settings.host.qm, None));

    let sysprep = check_tool("virt-sysprep", &settings.image.virt_sysprep, Some("--version"));
    report.add(if settings.image.sanitize {
        sysprep
    } else {
        sysprep.optional()
    });
    report.add(check_tool(
        "virt-customize",
        &settings.image.virt_customize,
        Some("--version"),
    ));

    report.add(check_dir("cache directory", &settings.cache_dir));
    report.add(check_dir("state directory", &settings.state_dir));
    report.add(check_dir("work directory", &settings.work_dir));
    report.add(check_dir("log directory", &settings.log_dir).optional());

    report.add(check_catalog(&settings.catalog_path));

    report.total_duration = start.elapsed();
    report
}

/// Check that a tool resolves to an executable, and read its version.
fn check_tool(name: &str, program: &Path, version_flag: Option<&str>) -> CheckResult {
    let start = Instant::now();

    let Some(path) = find_executable(program) else {
        return CheckResult::fail(name, format!("`{}` not found on PATH", program.display()))
            .with_duration(start.elapsed());
    };

    let mut result = CheckResult::pass(name, format!("{} is available", name)).with_path(path.clone());
    if let Some(flag) = version_flag {
        let version = ProcessBuilder::new(&path)
            .arg(flag)
            .timeout(Duration::from_secs(10))
            .exec()
            .ok()
            .filter(|o| o.status.success())
            .and_then(|o| {
                String::from_utf8_lossy(&o.stdout)
                    .lines()
                    .next()
                    .map(|l| l.trim().to_string())
            });
        if let Some(version) = version {
            result = result.with_version(version);
        }
    }
    result.with_duration(start.elapsed())
}

/// Check that a directory exists (or can be created) and accepts new files.
fn check_dir(name: &str, dir: &Path) -> CheckResult {
    let start = Instant::now();
    let writable = ensure_dir(dir).and_then(|_| {
        tempfile::NamedTempFile::new_in(dir)?;
        Ok(())
    });

    match writable {
        Ok(()) => CheckResult::pass(name, "writable"),
        Err(e) => CheckResult::fail(name, format!("not writable: {:#}", e)),
    }
    .with_path(dir.to_path_buf())
    .with_duration(start.elapsed())
}

fn check_catalog(path: &Path) -> CheckResult {
    let start = Instant::now();
    match Catalog::load(path) {
        Ok(catalog) => {
            CheckResult::pass("catalog", format!("{} image(s) defined", catalog.len()))
        }
        Err(e) => CheckResult::fail("catalog", e.to_string()),
    }
    .with_path(path.to_path_buf())
    .with_duration(start.elapsed())
}

/// Render the report for a terminal.
pub fn format_report(report: &DoctorReport, verbose: bool) -> String {
    let mut lines = vec!["imgforge doctor".to_string(), String::new()];

    if verbose {
        let unknown = "unknown".to_string();
        lines.push(format!(
            "Environment: {} ({})",
            report.environment.get("os").unwrap_or(&unknown),
            report.environment.get("arch").unwrap_or(&unknown)
        ));
        lines.push(String::new());
    }

    lines.push("Checks:".to_string());
    for check in &report.checks {
        let status = if check.passed { "[OK]" } else { "[!!]" };
        let required = if check.required { "" } else { " (optional)" };
        lines.push(format!("  {} {}{}", status, check.name, required));

        if verbose || !check.passed {
            lines.push(format!("      {}", check.message));
        }
        if verbose {
            if let Some(path) = &check.path {
                lines.push(format!("      Path: {}", path.display()));
            }
            if let Some(version) = &check.version {
                lines.push(format!("      Version: {}", version));
            }
        }
    }

    lines.push(String::new());
    lines.push(format!(
        "Summary: {} passed, {} failed",
        report.passed_count(),
        report.failed_count()
    ));

    let required_failed = report.required_failed_count();
    if required_failed > 0 {
        lines.push(format!(
            "\n{} required check(s) failed. Builds will not succeed on this host.",
            required_failed
        ));
    }

    let mut output = lines.join("\n");
    output.push('\n');
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fixtures;
    use tempfile::TempDir;

    #[test]
    fn test_missing_tools_fail_required_checks() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("catalog.toml"), fixtures::CATALOG_TOML).unwrap();
        let settings = fixtures::settings_with(tmp.path(), |c| {
            c.host.qm = PathBuf::from("/nonexistent/qm");
            c.image.virt_sysprep = PathBuf::from("/nonexistent/virt-sysprep");
            c.image.virt_customize = PathBuf::from("/nonexistent/virt-customize");
        });

        let report = doctor(&settings);
        assert!(!report.all_required_passed());
        assert_eq!(report.required_failed_count(), 3);

        let catalog = report.checks.iter().find(|c| c.name == "catalog").unwrap();
        assert!(catalog.passed);
        assert_eq!(catalog.message, "3 image(s) defined");

        let state = report
            .checks
            .iter()
            .find(|c| c.name == "state directory")
            .unwrap();
        assert!(state.passed);
    }

    #[test]
    fn test_sysprep_optional_when_sanitize_disabled() {
        let tmp = TempDir::new().unwrap();
        let settings = fixtures::settings_with(tmp.path(), |c| {
            c.image.sanitize = false;
            c.image.virt_sysprep = PathBuf::from("/nonexistent/virt-sysprep");
        });

        let report = doctor(&settings);
        let sysprep = report
            .checks
            .iter()
            .find(|c| c.name == "virt-sysprep")
            .unwrap();
        assert!(!sysprep.passed);
        assert!(!sysprep.required);
    }

    #[test]
    fn test_format_report_shows_failures() {
        let mut report = DoctorReport::default();
        report.add(CheckResult::pass("catalog", "3 image(s) defined"));
        report.add(CheckResult::fail("qm", "`qm` not found on PATH"));

        let output = format_report(&report, false);
        assert!(output.contains("[OK] catalog"));
        assert!(output.contains("[!!] qm"));
        assert!(output.contains("`qm` not found on PATH"));
        assert!(output.contains("Summary: 1 passed, 1 failed"));
        assert!(output.contains("1 required check(s) failed"));
    }
}
