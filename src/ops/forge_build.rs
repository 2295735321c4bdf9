//! Implementation of `imgforge build`.
//!
//! Artifacts are processed strictly one at a time, in selection order. Each
//! one runs the full [`Pipeline`]; a failure either halts the whole run (the
//! default) or is recorded and the run moves on (`keep_going`).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backend::Collaborators;
use crate::builder::events::BuildEvent;
use crate::builder::pipeline::{ArtifactOutcome, Pipeline, PipelineError};
use crate::builder::state::StateStore;
use crate::core::catalog::Catalog;
use crate::util::context::Settings;
use crate::util::shell::{format_duration, Shell, Status};

/// Options for one build invocation.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Labels to build, in order
    pub labels: Vec<String>,
    /// Per-run log file, named in failure reports
    pub log_file: Option<PathBuf>,
}

/// Outcome of a whole run.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub built: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<PipelineError>,
    /// Selected but never started because the run halted
    pub not_attempted: Vec<String>,
    pub duration: Duration,
}

impl RunSummary {
    pub fn success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Build every selected artifact.
pub fn build(
    catalog: &Catalog,
    settings: &Settings,
    collaborators: Collaborators<'_>,
    shell: &Arc<Shell>,
    options: &BuildOptions,
) -> RunSummary {
    let started = Instant::now();
    let state = StateStore::new(&settings.state_dir);
    let pipeline = Pipeline::new(settings, collaborators, &state, Arc::clone(shell));
    let mut summary = RunSummary::default();

    if settings.dry_run {
        shell.note("dry-run: nothing will be changed");
    }

    for (position, label) in options.labels.iter().enumerate() {
        let Some(artifact) = catalog.by_label(label) else {
            tracing::warn!("unknown label `{}`, skipping", label);
            continue;
        };

        tracing::info!("building {} (vmid {})", artifact.label, artifact.vmid);
        shell.status(
            Status::Building,
            format!("{} (vmid {})", artifact.label, artifact.vmid),
        );
        shell.json_event(
            &BuildEvent::ArtifactStarted {
                label: artifact.label.clone(),
                vmid: artifact.vmid,
                dry_run: settings.dry_run,
            }
            .to_value(),
        );

        let artifact_started = Instant::now();
        match pipeline.run(artifact) {
            Ok(report) => match report.outcome {
                ArtifactOutcome::Skipped => {
                    shell.status(Status::Skipped, format!("{} (unchanged)", artifact.label));
                    shell.json_event(
                        &BuildEvent::ArtifactSkipped {
                            label: artifact.label.clone(),
                            vmid: artifact.vmid,
                        }
                        .to_value(),
                    );
                    summary.skipped.push(artifact.label.clone());
                }
                ArtifactOutcome::Built { signature } => {
                    let elapsed = artifact_started.elapsed();
                    let verb = if settings.dry_run { "would build" } else { "built" };
                    shell.status(
                        Status::Built,
                        format!(
                            "{} ({} vmid {} in {})",
                            artifact.label,
                            verb,
                            artifact.vmid,
                            format_duration(elapsed)
                        ),
                    );
                    shell.json_event(
                        &BuildEvent::ArtifactBuilt {
                            label: artifact.label.clone(),
                            vmid: artifact.vmid,
                            signature,
                            dry_run: settings.dry_run,
                            duration_ms: elapsed.as_millis() as u64,
                        }
                        .to_value(),
                    );
                    summary.built.push(artifact.label.clone());
                }
            },
            Err(err) => {
                tracing::error!("{}: {}", err, err.source);
                shell.status(Status::Error, format!("{}: {}", err, err.source));
                shell.json_event(
                    &BuildEvent::ArtifactFailed {
                        label: err.label.clone(),
                        vmid: err.vmid,
                        step: err.step.name().to_string(),
                        kind: err.source.kind().to_string(),
                        message: err.source.to_string(),
                    }
                    .to_value(),
                );
                summary.failed.push(err);

                if !settings.keep_going {
                    summary.not_attempted = options.labels[position + 1..].to_vec();
                    if !summary.not_attempted.is_empty() {
                        tracing::warn!(
                            "halting; not attempted: {}",
                            summary.not_attempted.join(", ")
                        );
                    }
                    break;
                }
            }
        }
    }

    summary.duration = started.elapsed();
    shell.json_event(
        &BuildEvent::BuildFinished {
            success: summary.success(),
            built: summary.built.len() as u64,
            skipped: summary.skipped.len() as u64,
            failed: summary.failed.len() as u64,
            not_attempted: summary.not_attempted.len() as u64,
            duration_ms: summary.duration.as_millis() as u64,
            log_file: options.log_file.as_ref().map(|p| p.display().to_string()),
        }
        .to_value(),
    );
    tracing::info!(
        built = summary.built.len(),
        skipped = summary.skipped.len(),
        failed = summary.failed.len(),
        not_attempted = summary.not_attempted.len(),
        "run finished"
    );

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ResourceControl;
    use crate::builder::pipeline::Step;
    use crate::core::errors::ForgeError;
    use crate::ops::select::{resolve, SelectionMode};
    use crate::test_support::{fixtures, FakeBackend};
    use tempfile::TempDir;

    fn options(labels: &[&str]) -> BuildOptions {
        BuildOptions {
            labels: labels.iter().map(|s| s.to_string()).collect(),
            log_file: None,
        }
    }

    fn silent() -> Arc<Shell> {
        Arc::new(Shell::silent())
    }

    #[test]
    fn test_second_run_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let settings = fixtures::settings(tmp.path());
        let catalog = fixtures::catalog(tmp.path());
        let backend = FakeBackend::new();

        let first = build(&catalog, &settings, backend.collaborators(), &silent(), &options(&["Debian 12"]));
        assert_eq!(first.built, ["Debian 12"]);

        backend.clear_calls();
        let second = build(&catalog, &settings, backend.collaborators(), &silent(), &options(&["Debian 12"]));
        assert_eq!(second.skipped, ["Debian 12"]);
        assert!(second.built.is_empty());
        assert_eq!(backend.call_names(), ["fetch", "exists"]);
    }

    #[test]
    fn test_debian_scenario() {
        let tmp = TempDir::new().unwrap();
        let catalog = fixtures::catalog(tmp.path());
        let backend = FakeBackend::new();

        // Run 1: change tracking off, always builds.
        let untracked = fixtures::settings_with(tmp.path(), |c| c.build.change_tracking = false);
        let run1 = build(&catalog, &untracked, backend.collaborators(), &silent(), &options(&["Debian 12"]));
        assert_eq!(run1.built, ["Debian 12"]);
        assert!(backend.is_live(9000));

        // Run 2: tracking on, unchanged source, live resource 9000.
        backend.clear_calls();
        let tracked = fixtures::settings(tmp.path());
        let run2 = build(&catalog, &tracked, backend.collaborators(), &silent(), &options(&["Debian 12"]));
        assert_eq!(run2.skipped, ["Debian 12"]);
        assert_eq!(backend.count("sanitize"), 0);
        assert_eq!(backend.count("create"), 0);
    }

    #[test]
    fn test_missing_resource_forces_rebuild() {
        let tmp = TempDir::new().unwrap();
        let settings = fixtures::settings(tmp.path());
        let catalog = fixtures::catalog(tmp.path());
        let backend = FakeBackend::new();

        build(&catalog, &settings, backend.collaborators(), &silent(), &options(&["Debian 12"]));
        backend.destroy(9000).unwrap();

        let again = build(&catalog, &settings, backend.collaborators(), &silent(), &options(&["Debian 12"]));
        assert_eq!(again.built, ["Debian 12"]);
    }

    #[test]
    fn test_configuration_drift_forces_rebuild() {
        let tmp = TempDir::new().unwrap();
        let catalog = fixtures::catalog(tmp.path());
        let backend = FakeBackend::new();

        let settings = fixtures::settings(tmp.path());
        build(&catalog, &settings, backend.collaborators(), &silent(), &options(&["Debian 12"]));

        let drifted = fixtures::settings_with(tmp.path(), |c| c.host.bridge = "vmbr1".to_string());
        let again = build(&catalog, &drifted, backend.collaborators(), &silent(), &options(&["Debian 12"]));
        assert_eq!(again.built, ["Debian 12"]);
    }

    #[test]
    fn test_checksum_spec_change_forces_rebuild() {
        let tmp = TempDir::new().unwrap();
        let settings = fixtures::settings(tmp.path());
        let catalog = fixtures::catalog(tmp.path());
        let backend = FakeBackend::new();
        build(&catalog, &settings, backend.collaborators(), &silent(), &options(&["Debian 12"]));

        // Same image, now with a (matching) checksum declared.
        let artifact = catalog.by_label("Debian 12").unwrap();
        let digest = fixtures::checksum_of(&backend.image_bytes(&artifact.source)).digest;
        let content = fixtures::CATALOG_TOML.replacen(
            "packages = [\"qemu-guest-agent\", \"curl\"]",
            &format!(
                "packages = [\"qemu-guest-agent\", \"curl\"]\nchecksum = {{ algorithm = \"sha256\", digest = \"{}\" }}",
                digest
            ),
            1,
        );
        let with_checksum = Catalog::parse(&content, &tmp.path().join("catalog.toml")).unwrap();

        let again = build(&with_checksum, &settings, backend.collaborators(), &silent(), &options(&["Debian 12"]));
        assert_eq!(again.built, ["Debian 12"]);
    }

    #[test]
    fn test_dry_run_parity() {
        let tmp = TempDir::new().unwrap();
        let catalog = fixtures::catalog(tmp.path());
        let backend = FakeBackend::new();
        let settings = fixtures::settings(tmp.path());
        let dry = Settings {
            dry_run: true,
            ..fixtures::settings(tmp.path())
        };

        // Nothing built yet: both modes decide to build.
        let planned = build(&catalog, &dry, backend.collaborators(), &silent(), &options(&["Debian 12"]));
        assert_eq!(planned.built, ["Debian 12"]);
        assert!(backend.mutating_calls().is_empty());

        build(&catalog, &settings, backend.collaborators(), &silent(), &options(&["Debian 12"]));

        // Built and unchanged: both modes skip.
        backend.clear_calls();
        let dry_again = build(&catalog, &dry, backend.collaborators(), &silent(), &options(&["Debian 12"]));
        assert_eq!(dry_again.skipped, ["Debian 12"]);
        assert!(backend.mutating_calls().is_empty());

        let real_again = build(&catalog, &settings, backend.collaborators(), &silent(), &options(&["Debian 12"]));
        assert_eq!(real_again.skipped, ["Debian 12"]);
    }

    #[test]
    fn test_halt_on_first_failure() {
        let tmp = TempDir::new().unwrap();
        let settings = fixtures::settings(tmp.path());
        let catalog = fixtures::catalog(tmp.path());
        let backend = FakeBackend::new();
        backend.fail_on("configure");

        let all = resolve(&catalog, &SelectionMode::All).labels;
        let summary = build(
            &catalog,
            &settings,
            backend.collaborators(),
            &silent(),
            &BuildOptions { labels: all, log_file: None },
        );

        assert!(!summary.success());
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].label, "Debian 12");
        assert_eq!(summary.failed[0].step, Step::Configure);
        assert_eq!(summary.not_attempted, ["Ubuntu 24.04", "Rocky 9"]);
        assert_eq!(backend.count("create"), 1);
    }

    #[test]
    fn test_keep_going_reports_every_failure() {
        let tmp = TempDir::new().unwrap();
        let settings = fixtures::settings_with(tmp.path(), |c| c.build.keep_going = true);
        let catalog = fixtures::catalog(tmp.path());
        let backend = FakeBackend::new();
        backend.fail_on("resize");

        let summary = build(
            &catalog,
            &settings,
            backend.collaborators(),
            &silent(),
            &options(&["Debian 12", "Rocky 9"]),
        );
        assert_eq!(summary.failed.len(), 2);
        assert!(summary.not_attempted.is_empty());
        assert!(summary
            .failed
            .iter()
            .all(|e| matches!(e.source, ForgeError::Collaborator { .. })));
        assert!(StateStore::new(&settings.state_dir).list().unwrap().is_empty());
    }
}
