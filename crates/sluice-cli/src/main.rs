//! Sluice CLI entrypoint.

use clap::Parser;
use std::path::PathBuf;

mod commands;
mod config;
mod handlers;
mod project;

use commands::{Commands, ConfigCommands};
use config::CliConfig;

#[derive(Parser)]
#[command(name = "sluice")]
#[command(author, version, about = "Sluice pipeline engine command-line interface", long_about = None)]
struct Cli {
    /// Engine configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cli_config = CliConfig::load().unwrap_or_default();
    let engine_config = cli_config.engine_config(cli.config.as_deref())?;

    sluice_trace::init_tracer(&engine_config.tracing)?;

    let result = match cli.command {
        Commands::Validate { project } => handlers::validate(&project, &engine_config).await,
        Commands::Run {
            project,
            pipeline,
            follow,
        } => handlers::run(&project, &pipeline, follow, &engine_config).await,
        Commands::Serve { project } => handlers::serve(&project, &engine_config).await,
        Commands::Schema => handlers::schema(),
        Commands::Config { command } => match command {
            ConfigCommands::Show => handlers::show_config(&cli_config, &engine_config),
        },
    };

    sluice_trace::shutdown_tracer();
    result
}
