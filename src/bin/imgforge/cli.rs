//! CLI definitions using clap.

use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell as CompletionShell;
use imgforge::util::shell::ColorChoice;

/// imgforge - build VM templates from a catalog of cloud images
#[derive(Parser)]
#[command(name = "imgforge")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// More output (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only print errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// When to use colors
    #[arg(long, value_enum, default_value_t = ColorChoice::Auto, global = true)]
    pub color: ColorChoice,

    /// Config file to use instead of the default lookup
    #[arg(long, env = "IMGFORGE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Catalog file, overriding `paths.catalog`
    #[arg(long, env = "IMGFORGE_CATALOG", global = true)]
    pub catalog: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build templates for the selected images
    Build(BuildArgs),

    /// Print the validated catalog
    List,

    /// Inspect or reset change-tracking state
    State(StateArgs),

    /// Check that the host tools and directories are usable
    Doctor,

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum MessageFormat {
    #[default]
    Human,
    Json,
}

#[derive(Args)]
pub struct BuildArgs {
    /// Image labels to build, in order (`all` selects every image)
    pub labels: Vec<String>,

    /// Build every image without prompting
    #[arg(long, conflicts_with = "labels")]
    pub all: bool,

    /// Log what would be done without changing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Skip the settle delay around the disk resize
    #[arg(long)]
    pub no_delay: bool,

    /// Validate the catalog and exit
    #[arg(long)]
    pub validate_only: bool,

    /// Rebuild even when nothing changed
    #[arg(long)]
    pub no_change_tracking: bool,

    /// Continue with the remaining images after a failure
    #[arg(long)]
    pub keep_going: bool,

    /// Output format for build events
    #[arg(long, value_enum, default_value_t = MessageFormat::Human)]
    pub message_format: MessageFormat,
}

#[derive(Args)]
pub struct StateArgs {
    #[command(subcommand)]
    pub command: StateCommand,
}

#[derive(Subcommand)]
pub enum StateCommand {
    /// Show recorded state for one VM ID, or all of them
    Show {
        vmid: Option<u32>,
    },

    /// Forget the recorded state for a VM ID, forcing its next rebuild
    Clear {
        vmid: u32,
    },
}

#[derive(Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: CompletionShell,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_build_flags() {
        let cli = Cli::parse_from([
            "imgforge",
            "-vv",
            "build",
            "Debian 12",
            "--dry-run",
            "--message-format",
            "json",
        ]);
        assert_eq!(cli.verbose, 2);
        let Commands::Build(args) = cli.command else {
            panic!("expected build");
        };
        assert_eq!(args.labels, ["Debian 12"]);
        assert!(args.dry_run);
        assert_eq!(args.message_format, MessageFormat::Json);
    }
}
