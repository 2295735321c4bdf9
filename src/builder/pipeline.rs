//! The per-artifact provisioning pipeline.
//!
//! A pipeline run walks [`Step::ALL`] in order. Every step either continues
//! or, for the gate, ends the run early with "unchanged, skipped". The first
//! failing step aborts the run and is reported as a [`PipelineError`]; the
//! state record is only written by the last step, so a failed run never
//! touches it.
//!
//! In dry-run mode mutating steps only log what they would do and the next
//! step proceeds as if they succeeded. Read-only work (existence queries,
//! hashing an already cached file, reading state) still happens, so a dry run
//! reaches the same gate decision as a real one.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use thiserror::Error;

use crate::backend::{AttachSpec, Collaborators, Customization, VmSpec};
use crate::builder::events::BuildEvent;
use crate::builder::signature::{compute_signature, SignatureInputs};
use crate::builder::state::StateStore;
use crate::core::catalog::ArtifactDef;
use crate::core::errors::ForgeError;
use crate::util::context::Settings;
use crate::util::fs::{copy_file, ensure_dir, mtime_secs};
use crate::util::process::ProcessTimeout;
use crate::util::shell::{Shell, Status};

/// Pipeline steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Fetch,
    Verify,
    Signature,
    Gate,
    WorkingCopy,
    DestroyPrevious,
    Sanitize,
    Customize,
    CreateShell,
    ImportDisk,
    Configure,
    Resize,
    Template,
    PersistState,
}

impl Step {
    pub const ALL: [Step; 14] = [
        Step::Fetch,
        Step::Verify,
        Step::Signature,
        Step::Gate,
        Step::WorkingCopy,
        Step::DestroyPrevious,
        Step::Sanitize,
        Step::Customize,
        Step::CreateShell,
        Step::ImportDisk,
        Step::Configure,
        Step::Resize,
        Step::Template,
        Step::PersistState,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Step::Fetch => "fetch",
            Step::Verify => "verify",
            Step::Signature => "signature",
            Step::Gate => "gate",
            Step::WorkingCopy => "working-copy",
            Step::DestroyPrevious => "destroy-previous",
            Step::Sanitize => "sanitize",
            Step::Customize => "customize",
            Step::CreateShell => "create",
            Step::ImportDisk => "import-disk",
            Step::Configure => "configure",
            Step::Resize => "resize",
            Step::Template => "template",
            Step::PersistState => "persist-state",
        }
    }

    /// Whether the step changes anything outside the process.
    ///
    /// Mutating steps are simulated in dry-run mode.
    pub fn is_mutating(self) -> bool {
        !matches!(self, Step::Verify | Step::Signature | Step::Gate)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What the pipeline does after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    /// Stop here; the artifact is up to date
    Skip,
}

/// A failed artifact: which one, at which step, and why.
#[derive(Debug, Error)]
#[error("{label}: step `{step}` failed")]
pub struct PipelineError {
    pub label: String,
    pub vmid: u32,
    pub step: Step,
    #[source]
    pub source: ForgeError,
}

/// One entry of the step log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub step: Step,
    pub simulated: bool,
    pub duration: Duration,
}

/// How an artifact run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactOutcome {
    /// Every step ran (or was simulated, in dry-run)
    Built { signature: String },
    /// The gate found nothing to do
    Skipped,
}

/// Result of a successful pipeline run.
#[derive(Debug, Clone)]
pub struct ArtifactReport {
    pub outcome: ArtifactOutcome,
    pub steps: Vec<StepRecord>,
}

/// Ephemeral state of one run. Dropping it discards the working copy.
struct PipelineRun<'a> {
    artifact: &'a ArtifactDef,
    cached_image: PathBuf,
    source_mtime: Option<u64>,
    signature: Option<String>,
    work: Option<TempDir>,
    working_copy: Option<PathBuf>,
    disk: Option<String>,
    log: Vec<StepRecord>,
}

impl PipelineRun<'_> {
    /// Path of the working copy, or where it would be in dry-run.
    fn image_path(&self, settings: &Settings) -> PathBuf {
        self.working_copy
            .clone()
            .unwrap_or_else(|| settings.work_dir.join(self.artifact.cache_file_name()))
    }
}

/// Drives the steps of one artifact against the collaborators.
pub struct Pipeline<'a> {
    settings: &'a Settings,
    collaborators: Collaborators<'a>,
    state: &'a StateStore,
    shell: Arc<Shell>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        settings: &'a Settings,
        collaborators: Collaborators<'a>,
        state: &'a StateStore,
        shell: Arc<Shell>,
    ) -> Self {
        Pipeline {
            settings,
            collaborators,
            state,
            shell,
        }
    }

    /// Run every step for `artifact`.
    pub fn run(&self, artifact: &ArtifactDef) -> Result<ArtifactReport, PipelineError> {
        let mut run = PipelineRun {
            artifact,
            cached_image: self.settings.cache_dir.join(artifact.cache_file_name()),
            source_mtime: None,
            signature: None,
            work: None,
            working_copy: None,
            disk: None,
            log: Vec::with_capacity(Step::ALL.len()),
        };

        for step in Step::ALL {
            let started = Instant::now();
            let simulated = self.settings.dry_run && step.is_mutating();
            tracing::debug!(label = %artifact.label, %step, simulated, "step started");

            let outcome = self
                .run_step(&mut run, step)
                .map_err(|source| PipelineError {
                    label: artifact.label.clone(),
                    vmid: artifact.vmid,
                    step,
                    source,
                })?;

            let duration = started.elapsed();
            tracing::debug!(label = %artifact.label, %step, ?duration, "step finished");
            self.shell.json_event(
                &BuildEvent::StepFinished {
                    label: artifact.label.clone(),
                    step: step.name().to_string(),
                    simulated,
                    duration_ms: duration.as_millis() as u64,
                }
                .to_value(),
            );
            run.log.push(StepRecord {
                step,
                simulated,
                duration,
            });

            if outcome == StepOutcome::Skip {
                return Ok(ArtifactReport {
                    outcome: ArtifactOutcome::Skipped,
                    steps: run.log,
                });
            }
        }

        let signature = run.signature.clone().unwrap_or_default();
        Ok(ArtifactReport {
            outcome: ArtifactOutcome::Built { signature },
            steps: run.log,
        })
    }

    fn run_step(&self, run: &mut PipelineRun<'_>, step: Step) -> Result<StepOutcome, ForgeError> {
        match step {
            Step::Fetch => self.fetch(run),
            Step::Verify => self.verify(run),
            Step::Signature => self.signature(run),
            Step::Gate => self.gate(run),
            Step::WorkingCopy => self.working_copy(run),
            Step::DestroyPrevious => self.destroy_previous(run),
            Step::Sanitize => self.sanitize(run),
            Step::Customize => self.customize(run),
            Step::CreateShell => self.create_shell(run),
            Step::ImportDisk => self.import_disk(run),
            Step::Configure => self.configure(run),
            Step::Resize => self.resize(run),
            Step::Template => self.template(run),
            Step::PersistState => self.persist_state(run),
        }
    }

    /// Log a simulated action; returns true in dry-run mode.
    fn simulate(&self, run: &PipelineRun<'_>, step: Step, action: impl fmt::Display) -> bool {
        if !self.settings.dry_run {
            return false;
        }
        tracing::info!(label = %run.artifact.label, %step, "dry-run: would {}", action);
        self.shell
            .status(Status::DryRun, format!("{} would {}", run.artifact.label, action));
        true
    }

    /// Convert a collaborator failure into the error taxonomy.
    fn collaborator_error(&self, step: Step, err: anyhow::Error) -> ForgeError {
        if let Some(timeout) = err.chain().find_map(|c| c.downcast_ref::<ProcessTimeout>()) {
            return ForgeError::Timeout {
                operation: timeout.command.clone(),
                timeout: timeout.timeout,
            };
        }
        if err
            .chain()
            .filter_map(|c| c.downcast_ref::<reqwest::Error>())
            .any(reqwest::Error::is_timeout)
        {
            return ForgeError::Timeout {
                operation: step.name().to_string(),
                timeout: self.settings.timeouts.fetch,
            };
        }
        ForgeError::Collaborator {
            operation: step.name().to_string(),
            message: format!("{:#}", err),
        }
    }

    fn fetch(&self, run: &mut PipelineRun<'_>) -> Result<StepOutcome, ForgeError> {
        let artifact = run.artifact;
        let source = &artifact.source;
        let dest = run.cached_image.clone();

        if self.simulate(
            run,
            Step::Fetch,
            format_args!("fetch {} into {}", source, dest.display()),
        ) {
            run.source_mtime = if dest.exists() {
                mtime_secs(&dest).ok()
            } else {
                tracing::info!("{} is not cached yet, source mtime unknown", source);
                None
            };
            return Ok(StepOutcome::Continue);
        }

        self.shell.status(Status::Fetching, source);
        let outcome = self
            .collaborators
            .fetcher
            .fetch(source, &dest)
            .map_err(|e| self.collaborator_error(Step::Fetch, e))?;
        if outcome.transferred {
            tracing::info!("fetched {} bytes into {}", outcome.bytes, dest.display());
        } else {
            self.shell
                .status(Status::Fresh, format!("{} (cached)", dest.display()));
        }

        let mtime =
            mtime_secs(&outcome.path).map_err(|e| self.collaborator_error(Step::Fetch, e))?;
        run.cached_image = outcome.path;
        run.source_mtime = Some(mtime);
        Ok(StepOutcome::Continue)
    }

    fn verify(&self, run: &mut PipelineRun<'_>) -> Result<StepOutcome, ForgeError> {
        let artifact = run.artifact;
        let Some(checksum) = &artifact.checksum else {
            tracing::warn!("{}: no checksum declared, source is unverified", artifact.label);
            self.shell.status(
                Status::Unverified,
                format!("{} (no checksum declared)", artifact.label),
            );
            self.shell.json_event(
                &BuildEvent::Unverified {
                    label: artifact.label.clone(),
                    source: artifact.source.to_string(),
                }
                .to_value(),
            );
            return Ok(StepOutcome::Continue);
        };

        if !run.cached_image.exists()
            && self.simulate(run, Step::Verify, format_args!("verify {}", checksum))
        {
            return Ok(StepOutcome::Continue);
        }

        let actual = checksum
            .algorithm
            .digest_file(&run.cached_image)
            .map_err(|e| self.collaborator_error(Step::Verify, e))?;
        if actual != checksum.digest {
            if self.settings.dry_run {
                // A real run re-fetches a stale cache, so its mtime is unknown.
                tracing::warn!(
                    "{}: cached {} does not match {}, a real run would re-fetch and verify",
                    artifact.label,
                    run.cached_image.display(),
                    checksum
                );
                self.shell.warn(format!(
                    "{}: cached copy does not match; a real run would re-fetch and verify",
                    artifact.label
                ));
                run.source_mtime = None;
                return Ok(StepOutcome::Continue);
            }
            return Err(ForgeError::Integrity {
                path: run.cached_image.clone(),
                algorithm: checksum.algorithm.to_string(),
                expected: checksum.digest.clone(),
                actual,
            });
        }

        tracing::info!("{}: {} digest verified", artifact.label, checksum.algorithm);
        self.shell.status(
            Status::Verified,
            format!("{} ({})", artifact.label, checksum.algorithm),
        );
        Ok(StepOutcome::Continue)
    }

    fn signature(&self, run: &mut PipelineRun<'_>) -> Result<StepOutcome, ForgeError> {
        let inputs = SignatureInputs::resolve(run.artifact, self.settings, run.source_mtime);
        let signature =
            compute_signature(&inputs).map_err(|e| self.collaborator_error(Step::Signature, e))?;
        tracing::debug!("{}: signature {}", run.artifact.label, signature);
        run.signature = Some(signature);
        Ok(StepOutcome::Continue)
    }

    fn gate(&self, run: &mut PipelineRun<'_>) -> Result<StepOutcome, ForgeError> {
        let artifact = run.artifact;
        if !self.settings.change_tracking {
            tracing::info!("{}: change tracking disabled, rebuilding", artifact.label);
            return Ok(StepOutcome::Continue);
        }

        let Some(record) = self.state.read(artifact.vmid) else {
            tracing::info!("{}: no state record, building", artifact.label);
            return Ok(StepOutcome::Continue);
        };

        let signature = run.signature.as_deref().unwrap_or_default();
        if !record.matches(run.source_mtime, signature) {
            tracing::info!(
                "{}: inputs changed since the last build (mtime {:?} -> {:?}), rebuilding",
                artifact.label,
                record.source_mtime,
                run.source_mtime
            );
            return Ok(StepOutcome::Continue);
        }

        let live = self
            .collaborators
            .control
            .exists(artifact.vmid)
            .map_err(|e| self.collaborator_error(Step::Gate, e))?;
        if !live {
            tracing::info!(
                "{}: resource {} is missing on the host, rebuilding",
                artifact.label,
                artifact.vmid
            );
            return Ok(StepOutcome::Continue);
        }

        tracing::info!("{}: unchanged, skipped", artifact.label);
        Ok(StepOutcome::Skip)
    }

    fn working_copy(&self, run: &mut PipelineRun<'_>) -> Result<StepOutcome, ForgeError> {
        let target = run.image_path(self.settings);
        if self.simulate(
            run,
            Step::WorkingCopy,
            format_args!("copy the cached image to {}", target.display()),
        ) {
            return Ok(StepOutcome::Continue);
        }

        let copy = || -> anyhow::Result<(TempDir, PathBuf)> {
            ensure_dir(&self.settings.work_dir)?;
            let work = tempfile::Builder::new()
                .prefix(&format!("imgforge-{}-", run.artifact.vmid))
                .tempdir_in(&self.settings.work_dir)?;
            let path = work.path().join(run.artifact.cache_file_name());
            copy_file(&run.cached_image, &path)?;
            Ok((work, path))
        };
        let (work, path) = copy().map_err(|e| self.collaborator_error(Step::WorkingCopy, e))?;

        tracing::info!("working copy at {}", path.display());
        run.work = Some(work);
        run.working_copy = Some(path);
        Ok(StepOutcome::Continue)
    }

    fn destroy_previous(&self, run: &mut PipelineRun<'_>) -> Result<StepOutcome, ForgeError> {
        let vmid = run.artifact.vmid;
        if self.simulate(
            run,
            Step::DestroyPrevious,
            format_args!("destroy any existing resource {}", vmid),
        ) {
            return Ok(StepOutcome::Continue);
        }
        self.collaborators
            .control
            .destroy(vmid)
            .map_err(|e| self.collaborator_error(Step::DestroyPrevious, e))?;
        Ok(StepOutcome::Continue)
    }

    fn sanitize(&self, run: &mut PipelineRun<'_>) -> Result<StepOutcome, ForgeError> {
        if !self.settings.image.sanitize {
            tracing::info!("{}: sanitize disabled", run.artifact.label);
            return Ok(StepOutcome::Continue);
        }
        let image = run.image_path(self.settings);
        if self.simulate(run, Step::Sanitize, format_args!("sanitize {}", image.display())) {
            return Ok(StepOutcome::Continue);
        }
        self.collaborators
            .image_tool
            .sanitize(&image)
            .map_err(|e| self.collaborator_error(Step::Sanitize, e))?;
        Ok(StepOutcome::Continue)
    }

    fn customize(&self, run: &mut PipelineRun<'_>) -> Result<StepOutcome, ForgeError> {
        let customization = Customization {
            packages: run.artifact.packages.clone(),
            timezone: self.settings.image.timezone.clone(),
            locale: self.settings.image.locale.clone(),
        };
        let image = run.image_path(self.settings);
        if self.simulate(
            run,
            Step::Customize,
            format_args!(
                "customize {} (packages [{}], timezone {}, locale {})",
                image.display(),
                customization.packages.join(", "),
                customization.timezone,
                customization.locale
            ),
        ) {
            return Ok(StepOutcome::Continue);
        }
        self.collaborators
            .image_tool
            .customize(&image, &customization)
            .map_err(|e| self.collaborator_error(Step::Customize, e))?;
        Ok(StepOutcome::Continue)
    }

    fn create_shell(&self, run: &mut PipelineRun<'_>) -> Result<StepOutcome, ForgeError> {
        let artifact = run.artifact;
        let host = &self.settings.host;
        let spec = VmSpec {
            vmid: artifact.vmid,
            name: artifact.target_name.clone(),
            memory_mb: artifact.memory_mb.unwrap_or(host.memory_mb),
            cores: artifact.cores.unwrap_or(host.cores),
            bridge: host.bridge.clone(),
        };
        if self.simulate(
            run,
            Step::CreateShell,
            format_args!(
                "create VM {} `{}` ({} MiB, {} cores, bridge {})",
                spec.vmid, spec.name, spec.memory_mb, spec.cores, spec.bridge
            ),
        ) {
            return Ok(StepOutcome::Continue);
        }
        self.collaborators
            .control
            .create(&spec)
            .map_err(|e| self.collaborator_error(Step::CreateShell, e))?;
        Ok(StepOutcome::Continue)
    }

    fn import_disk(&self, run: &mut PipelineRun<'_>) -> Result<StepOutcome, ForgeError> {
        let vmid = run.artifact.vmid;
        let image = run.image_path(self.settings);
        let storage = &self.settings.host.storage;
        if self.simulate(
            run,
            Step::ImportDisk,
            format_args!("import {} into {} as the disk of {}", image.display(), storage, vmid),
        ) {
            run.disk = Some(format!("{}:vm-{}-disk-0", storage, vmid));
            return Ok(StepOutcome::Continue);
        }
        let disk = self
            .collaborators
            .control
            .import_disk(vmid, &image)
            .map_err(|e| self.collaborator_error(Step::ImportDisk, e))?;
        tracing::info!("{}: imported disk {}", run.artifact.label, disk);
        run.disk = Some(disk);
        Ok(StepOutcome::Continue)
    }

    fn configure(&self, run: &mut PipelineRun<'_>) -> Result<StepOutcome, ForgeError> {
        let ci = &self.settings.cloud_init;
        let spec = AttachSpec {
            disk: run.disk.clone().unwrap_or_default(),
            scsihw: self.settings.host.scsihw.clone(),
            serial_console: self.settings.image.serial_console,
            guest_agent: self.settings.image.guest_agent,
            ci_user: ci.user.clone(),
            ssh_keys_file: ci.ssh_keys.as_ref().and(ci.ssh_keys_file.clone()),
            password_hash: ci.password_hash.clone(),
            nameserver: ci.nameserver.clone(),
            searchdomain: ci.searchdomain.clone(),
            ipconfig: ci.ipconfig.clone(),
        };
        if self.simulate(
            run,
            Step::Configure,
            format_args!(
                "attach {} and configure cloud-init (user {}, ssh keys {}, password {}, ipconfig {})",
                spec.disk,
                spec.ci_user.as_deref().unwrap_or("<default>"),
                if spec.ssh_keys_file.is_some() { "set" } else { "none" },
                if spec.password_hash.is_some() { "set" } else { "none" },
                spec.ipconfig
            ),
        ) {
            return Ok(StepOutcome::Continue);
        }
        self.collaborators
            .control
            .configure(run.artifact.vmid, &spec)
            .map_err(|e| self.collaborator_error(Step::Configure, e))?;
        Ok(StepOutcome::Continue)
    }

    fn resize(&self, run: &mut PipelineRun<'_>) -> Result<StepOutcome, ForgeError> {
        let vmid = run.artifact.vmid;
        let size = run
            .artifact
            .disk_size
            .clone()
            .unwrap_or_else(|| self.settings.host.disk_size.clone());
        if self.simulate(
            run,
            Step::Resize,
            format_args!("resize the disk of {} to {}", vmid, size),
        ) {
            return Ok(StepOutcome::Continue);
        }

        self.settle();
        self.collaborators
            .control
            .resize(vmid, &size)
            .map_err(|e| self.collaborator_error(Step::Resize, e))?;
        self.settle();
        Ok(StepOutcome::Continue)
    }

    fn settle(&self) {
        let delay = self.settings.resize_delay;
        if !delay.is_zero() {
            tracing::debug!("waiting {:?} for storage to settle", delay);
            std::thread::sleep(delay);
        }
    }

    fn template(&self, run: &mut PipelineRun<'_>) -> Result<StepOutcome, ForgeError> {
        let vmid = run.artifact.vmid;
        if self.simulate(run, Step::Template, format_args!("convert {} to a template", vmid)) {
            return Ok(StepOutcome::Continue);
        }
        self.collaborators
            .control
            .convert_to_template(vmid)
            .map_err(|e| self.collaborator_error(Step::Template, e))?;
        Ok(StepOutcome::Continue)
    }

    fn persist_state(&self, run: &mut PipelineRun<'_>) -> Result<StepOutcome, ForgeError> {
        let vmid = run.artifact.vmid;
        let signature = run.signature.clone().unwrap_or_default();
        let short = &signature[..12.min(signature.len())];
        if self.simulate(
            run,
            Step::PersistState,
            format_args!("record signature {} for {}", short, vmid),
        ) {
            return Ok(StepOutcome::Continue);
        }

        let mtime = run.source_mtime.ok_or_else(|| ForgeError::Collaborator {
            operation: Step::PersistState.name().to_string(),
            message: "source mtime is unknown".to_string(),
        })?;
        self.state
            .write(vmid, mtime, &signature)
            .map_err(|e| self.collaborator_error(Step::PersistState, e))?;

        // Discard the working copy now that the template owns its disk.
        run.working_copy = None;
        run.work = None;
        Ok(StepOutcome::Continue)
    }
}
