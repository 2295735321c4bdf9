//! `imgforge build` command

use std::process::ExitCode;

use anyhow::Result;
use imgforge::backend::{Collaborators, GuestfsTool, HttpFetcher, QmControl};
use imgforge::builder::pipeline::PipelineError;
use imgforge::ops::forge_build::{build, BuildOptions, RunSummary};
use imgforge::ops::select::{resolve, SelectionMode};
use imgforge::util::diagnostic::{suggestions, Diagnostic};
use imgforge::util::shell::{format_duration, Status};
use imgforge::Catalog;

use super::RunContext;
use crate::cli::BuildArgs;
use crate::prompts;

pub fn execute(args: &BuildArgs, ctx: &RunContext) -> Result<ExitCode> {
    let settings = &ctx.settings;
    let shell = &ctx.shell;

    let catalog = Catalog::load(&settings.catalog_path)?;
    if args.validate_only {
        shell.status(
            Status::Verified,
            format!(
                "{} ({} image(s))",
                catalog.path().display(),
                catalog.len()
            ),
        );
        return Ok(ExitCode::SUCCESS);
    }

    let mode = if args.all {
        SelectionMode::All
    } else if !args.labels.is_empty() {
        SelectionMode::Labels(args.labels.clone())
    } else if prompts::is_interactive() {
        SelectionMode::Labels(prompts::choose_images(&catalog)?)
    } else {
        ctx.emit(
            &Diagnostic::error("no images selected and stdin is not a terminal")
                .with_suggestion(suggestions::NO_SELECTION),
        );
        return Ok(ExitCode::FAILURE);
    };

    let selection = resolve(&catalog, &mode);
    if selection.is_empty() {
        let mut diag = Diagnostic::error("nothing to build");
        if !selection.unknown.is_empty() {
            diag = diag.with_context(format!(
                "unknown label(s): {}",
                selection.unknown.join(", ")
            ));
        }
        ctx.emit(&diag.with_suggestion(suggestions::NO_SELECTION));
        return Ok(ExitCode::FAILURE);
    }

    let control = QmControl::new(
        &settings.host.qm,
        &settings.host.storage,
        settings.timeouts.control,
    );
    let image_tool = GuestfsTool::new(
        &settings.image.virt_sysprep,
        &settings.image.virt_customize,
        settings.timeouts.image_tool,
    );
    let fetcher = HttpFetcher::new(settings.timeouts.fetch, shell.clone())?;
    let collaborators = Collaborators {
        control: &control,
        image_tool: &image_tool,
        fetcher: &fetcher,
    };

    let options = BuildOptions {
        labels: selection.labels,
        log_file: ctx.log_file.clone(),
    };
    let summary = build(&catalog, settings, collaborators, shell, &options);

    if summary.success() {
        shell.status(Status::Finished, finished_line(&summary));
        return Ok(ExitCode::SUCCESS);
    }

    for failure in &summary.failed {
        ctx.emit(&failure_diagnostic(failure, &summary, ctx));
    }
    Ok(ExitCode::FAILURE)
}

fn finished_line(summary: &RunSummary) -> String {
    format!(
        "{} built, {} unchanged in {}",
        summary.built.len(),
        summary.skipped.len(),
        format_duration(summary.duration)
    )
}

/// Name the artifact, the step and where the full output went.
fn failure_diagnostic(failure: &PipelineError, summary: &RunSummary, ctx: &RunContext) -> Diagnostic {
    let mut diag = failure.source.to_diagnostic();
    diag.context.insert(0, diag.message.clone());
    diag.message = format!(
        "`{}` (vmid {}) failed at step `{}`",
        failure.label, failure.vmid, failure.step
    );

    if !summary.not_attempted.is_empty() {
        diag.context.push(format!(
            "not attempted: {}",
            summary.not_attempted.join(", ")
        ));
    }
    if let Some(log) = &ctx.log_file {
        diag.context.push(format!("full log: {}", log.display()));
    }
    diag
}
