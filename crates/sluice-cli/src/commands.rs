//! CLI command definitions.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a project file
    Validate {
        /// Path to project file
        #[arg(default_value = "sluice.yaml")]
        project: PathBuf,
    },

    /// Run a pipeline once and wait for it to finish
    Run {
        /// Path to project file
        project: PathBuf,

        /// Pipeline name
        pipeline: String,

        /// Stream execution logs
        #[arg(short, long)]
        follow: bool,
    },

    /// Run schedules until interrupted
    Serve {
        /// Path to project file
        #[arg(default_value = "sluice.yaml")]
        project: PathBuf,
    },

    /// Print the project file JSON schema
    Schema,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
}
