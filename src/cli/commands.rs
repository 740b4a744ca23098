//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Halldyll - Declarative infrastructure reconciliation engine.
#[derive(Parser, Debug)]
#[command(name = "halldyll-infra")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "HALLDYLL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true, env = "HALLDYLL_LOG_JSON")]
    pub log_json: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate the configuration and resource graph.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Print the resource graph in topological order.
    Graph,

    /// Generate and display the execution plan.
    Plan {
        /// Exit with status 2 if the plan has changes.
        #[arg(long)]
        check: bool,

        /// Show attribute-level changes.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Plan and apply changes.
    Apply {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Maximum steps in flight (overrides the configuration).
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Destroy every resource recorded in state.
    Destroy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Check for drift between state and providers.
    Drift,

    /// Resolve write-ahead markers left by interrupted runs.
    Reconcile {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Manage state backend.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show current state.
    Show,

    /// List resource addresses in state.
    List,

    /// Lock the state.
    Lock {
        /// Lock holder identifier.
        #[arg(long)]
        holder: Option<String>,
    },

    /// Unlock the state.
    Unlock {
        /// Lock ID to unlock.
        #[arg(long)]
        lock_id: Option<String>,

        /// Force unlock (dangerous).
        #[arg(long)]
        force: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_check_flag() {
        let cli = Cli::try_parse_from(["halldyll-infra", "plan", "--check"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Plan {
                check: true,
                detailed: false
            }
        ));
        assert_eq!(cli.output, OutputFormat::Text);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "halldyll-infra",
            "apply",
            "--yes",
            "--concurrency",
            "8",
            "--output",
            "json",
            "-c",
            "infra.yaml",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Apply {
                yes: true,
                concurrency: Some(8)
            }
        ));
        assert_eq!(cli.output, OutputFormat::Json);
        assert_eq!(cli.config, Some(PathBuf::from("infra.yaml")));
    }

    #[test]
    fn test_state_unlock() {
        let cli =
            Cli::try_parse_from(["halldyll-infra", "state", "unlock", "--force"]).unwrap();
        let Commands::State { command } = cli.command else {
            panic!("expected state command");
        };
        assert!(matches!(
            command,
            StateCommands::Unlock {
                lock_id: None,
                force: true
            }
        ));
    }
}
