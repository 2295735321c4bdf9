//! imgforge CLI - builds VM templates from a catalog of cloud images

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

mod cli;
mod commands;
mod logging;
mod prompts;

use cli::{Cli, Commands, MessageFormat};
use commands::RunContext;
use imgforge::util::config::load_config;
use imgforge::util::context::Overrides;
use imgforge::util::diagnostic::{emit, Diagnostic};
use imgforge::util::shell::Shell;
use imgforge::{ForgeError, Settings};

fn main() -> ExitCode {
    let cli = Cli::parse();

    let json = matches!(
        &cli.command,
        Commands::Build(args) if args.message_format == MessageFormat::Json
    );
    let shell = Arc::new(Shell::from_flags(cli.quiet, cli.verbose > 0, cli.color, json));

    match run(&cli, &shell) {
        Ok(code) => code,
        Err(err) => {
            report(&err, shell.use_color());
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli, shell: &Arc<Shell>) -> Result<ExitCode> {
    if let Commands::Completions(args) = &cli.command {
        return commands::completions::execute(args);
    }

    let cwd = std::env::current_dir().context("failed to read the current directory")?;
    let (config, config_path) = load_config(cli.config.as_deref(), &cwd)
        .map_err(|e| ForgeError::configuration(format!("{:#}", e)))?;
    let base_dir = config_path
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| cwd.clone());

    let mut overrides = Overrides {
        catalog: cli.catalog.clone(),
        ..Overrides::default()
    };
    if let Commands::Build(args) = &cli.command {
        overrides.dry_run = args.dry_run;
        overrides.no_delay = args.no_delay;
        overrides.no_change_tracking = args.no_change_tracking;
        overrides.keep_going = args.keep_going;
    }
    let settings = Settings::resolve(config, &overrides, &base_dir)?;

    // Only a real build gets a log file; validation and the read-only
    // commands log to the console alone.
    let wants_log_file = matches!(&cli.command, Commands::Build(args) if !args.validate_only);
    let log_file = logging::init(
        cli.verbose,
        cli.quiet,
        shell.use_color(),
        wants_log_file.then_some(settings.log_dir.as_path()),
    );
    match &config_path {
        Some(path) => tracing::debug!("configuration loaded from {}", path.display()),
        None => tracing::debug!("no config file found, using defaults"),
    }

    let ctx = RunContext {
        settings,
        shell: Arc::clone(shell),
        log_file,
        verbose: cli.verbose,
    };

    match &cli.command {
        Commands::Build(args) => commands::build::execute(args, &ctx),
        Commands::List => commands::list::execute(&ctx),
        Commands::State(args) => commands::state::execute(args, &ctx),
        Commands::Doctor => commands::doctor::execute(&ctx),
        Commands::Completions(args) => commands::completions::execute(args),
    }
}

/// Render a fatal error, with suggestions when it is one of ours.
fn report(err: &anyhow::Error, color: bool) {
    let diagnostic = match err.downcast_ref::<ForgeError>() {
        Some(forge) => forge.to_diagnostic(),
        None => Diagnostic::error(format!("{:#}", err)),
    };
    emit(&diagnostic, color);
}
