//! Command handlers.

use crate::config::CliConfig;
use crate::project::{Installed, Project, ProjectFile};
use anyhow::{Context, bail};
use console::style;
use futures::StreamExt;
use sluice_core::execution::{Execution, ExecutionStatus};
use sluice_core::log::{ExecutionLogEntry, LogLevel};
use sluice_scheduler::{DagResolver, Engine, EngineConfig, ShutdownPolicy};
use sluice_store::{FileDataAccess, memory_repositories};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

async fn open(project: &Path, config: &EngineConfig) -> anyhow::Result<(Engine, Installed)> {
    let engine = Engine::builder(memory_repositories(), Arc::new(FileDataAccess::default()))
        .config(config.clone())
        .build()?;
    let installed = Project::load(project)?
        .install(&engine)
        .await
        .with_context(|| format!("Failed to load project {}", project.display()))?;
    Ok((engine, installed))
}

/// Validate a project file and print each pipeline's stage order.
pub async fn validate(project: &Path, config: &EngineConfig) -> anyhow::Result<()> {
    let (engine, installed) = open(project, config).await?;
    let repos = engine.repositories();
    let known: HashSet<_> = repos.datasets.list().await?.into_iter().map(|d| d.id).collect();

    println!(
        "{} Project {} is valid",
        style("✓").green(),
        style(project.display()).bold()
    );

    let mut names: Vec<_> = installed.pipelines.keys().collect();
    names.sort();
    for name in names {
        let pipeline = repos.pipelines.get(installed.pipeline(name)?).await?;
        let plan = DagResolver::plan(&pipeline.definition, &known)?;
        let order: Vec<_> = plan.order().map(|id| id.as_str()).collect();
        println!("  {} ({} stages)", style(name).bold(), plan.len());
        println!("    order: {}", order.join(" -> "));
    }
    if !installed.schedules.is_empty() {
        println!("  Schedules: {}", installed.schedules.len());
    }
    Ok(())
}

/// Run one pipeline to completion.
pub async fn run(
    project: &Path,
    pipeline: &str,
    follow: bool,
    config: &EngineConfig,
) -> anyhow::Result<()> {
    let (engine, installed) = open(project, config).await?;
    let pipeline_id = installed.pipeline(pipeline)?;

    let execution_id = engine.submit_execution(pipeline_id, None).await?;
    println!(
        "{} Running {} ({})",
        style("▶").cyan(),
        style(pipeline).bold(),
        style(execution_id).dim()
    );

    let mut logs = engine.stream_logs(execution_id).await?;
    while let Some(entry) = logs.next().await {
        if follow {
            print_entry(&entry);
        }
    }

    let execution = engine.get_execution(execution_id).await?;
    engine.shutdown(ShutdownPolicy::Drain).await;
    print_summary(&execution);

    if execution.status != ExecutionStatus::Succeeded {
        bail!("Execution {} ended {:?}", execution_id, execution.status);
    }
    Ok(())
}

/// Load a project and fire its schedules until Ctrl-C.
pub async fn serve(project: &Path, config: &EngineConfig) -> anyhow::Result<()> {
    let (engine, installed) = open(project, config).await?;
    engine.start().await?;

    println!(
        "{} Serving {} pipelines, {} schedules (Ctrl+C to stop)",
        style("▶").cyan(),
        installed.pipelines.len(),
        installed.schedules.len()
    );

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received");
    println!("{} Draining running executions...", style("!").yellow());
    engine.shutdown(ShutdownPolicy::Drain).await;
    println!("{} Stopped", style("✓").green());
    Ok(())
}

/// Print the project file JSON schema.
pub fn schema() -> anyhow::Result<()> {
    let schema = schemars::schema_for!(ProjectFile);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

/// Show configuration.
pub fn show_config(cli: &CliConfig, engine: &EngineConfig) -> anyhow::Result<()> {
    match CliConfig::config_path() {
        Ok(path) => println!("{} {}", style("Config file:").bold(), path.display()),
        Err(e) => println!("{} {}", style("!").yellow(), e),
    }
    if let Some(path) = &cli.engine_config {
        println!("{} {}", style("Engine config:").bold(), path.display());
    }
    println!();
    print!("{}", serde_yaml::to_string(engine)?);
    Ok(())
}

fn print_entry(entry: &ExecutionLogEntry) {
    let level = match entry.level {
        LogLevel::Error => style(entry.level.to_string()).red(),
        LogLevel::Warn => style(entry.level.to_string()).yellow(),
        LogLevel::Info => style(entry.level.to_string()).green(),
        LogLevel::Debug => style(entry.level.to_string()).dim(),
    };
    let stage = entry
        .stage_id
        .as_ref()
        .map(|s| format!(" [{s}]"))
        .unwrap_or_default();
    println!(
        "{} {:>5}{} {}",
        style(entry.timestamp.format("%H:%M:%S%.3f")).dim(),
        level,
        stage,
        entry.message
    );
}

fn print_summary(execution: &Execution) {
    let marker = match execution.status {
        ExecutionStatus::Succeeded => style("✓").green(),
        ExecutionStatus::Cancelled => style("!").yellow(),
        _ => style("✗").red(),
    };
    let duration = execution
        .duration_ms()
        .map(|ms| format!(" in {ms}ms"))
        .unwrap_or_default();
    println!(
        "{} {:?}{} ({} retries)",
        marker, execution.status, duration, execution.retry_count
    );
    for (stage, state) in &execution.stages {
        let detail = state
            .error
            .as_deref()
            .map(|e| format!(": {e}"))
            .unwrap_or_default();
        println!(
            "    - {} {:?} ({} attempts){}",
            stage, state.status, state.attempts, detail
        );
    }
    if let Some(summary) = &execution.error_summary {
        println!("  {}", style(summary).red());
    }
}
