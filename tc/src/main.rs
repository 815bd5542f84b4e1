//! TaskCell - recursive, budget-governed task delegation
//!
//! CLI entry point for running and validating scripted scenarios.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser};
use colored::Colorize;
use eyre::{Context, Result};
use tokio::sync::broadcast::error::TryRecvError;
use tracing::{info, warn};

use taskcell::cli::{Cli, Command, DEFAULT_BUDGET, OutputFormat};
use taskcell::collab::{
    AuditSink, Collaborators, JsonlAuditSink, NullAuditSink, Scenario, ScriptedCollaborators, StaticPressure,
};
use taskcell::config::Config;
use taskcell::domain::{Budget, CellOutcome, Mode, Resolution};
use taskcell::error::KernelError;
use taskcell::kernel::Kernel;

fn setup_logging(verbose: bool) -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("taskcell")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Setup tracing subscriber - write to log file, not stdout/stderr
    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    let log_file = fs::File::create(log_dir.join("taskcell.log")).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (verbose: {})", verbose);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    config.validate()?;

    match cli.command {
        Some(Command::Run {
            scenario,
            budget,
            format,
            audit,
        }) => cmd_run(&config, &scenario, budget, format, audit, cli.verbose).await,
        Some(Command::Validate { scenario }) => cmd_validate(&scenario),
        Some(Command::Config) => cmd_config(&config),
        None => {
            Cli::command().print_help()?;
            println!();
            Ok(())
        }
    }
}

fn load_scenario(path: &Path) -> Result<Scenario> {
    let scenario = Scenario::load(path)?;
    if let Err(problems) = scenario.validate() {
        return Err(eyre::eyre!(
            "Scenario {} is invalid:\n  {}",
            path.display(),
            problems.join("\n  ")
        ));
    }
    Ok(scenario)
}

/// Submit a scenario's root task and print the outcome
async fn cmd_run(
    config: &Config,
    path: &Path,
    budget: Option<f64>,
    format: OutputFormat,
    audit: Option<PathBuf>,
    verbose: bool,
) -> Result<()> {
    let scenario = load_scenario(path)?;
    let total = match budget {
        Some(units) if units > 0.0 => Budget::from_units(units),
        Some(units) => return Err(eyre::eyre!("Budget must be positive, got {}", units)),
        None => scenario.budget.unwrap_or_else(|| Budget::from_units(DEFAULT_BUDGET)),
    };

    let audit_path = audit.or_else(|| config.audit.enabled.then(|| config.audit.resolved_path()));
    let jsonl = match &audit_path {
        Some(path) => Some(Arc::new(JsonlAuditSink::spawn(path)?)),
        None => None,
    };
    let sink: Arc<dyn AuditSink> = match &jsonl {
        Some(sink) => sink.clone(),
        None => Arc::new(NullAuditSink),
    };

    let task = scenario.root.clone();
    let pressure = scenario.pressure;
    let script = Arc::new(ScriptedCollaborators::new(scenario));
    let kernel = Kernel::new(
        config.clone(),
        Collaborators::scripted(script),
        Arc::new(StaticPressure::new(pressure)),
        sink,
    );
    let mut events = kernel.events();

    info!(scenario = %path.display(), %total, "Running scenario");
    let submission = kernel.submit(task, total);
    tokio::pin!(submission);
    let outcome = tokio::select! {
        outcome = &mut submission => outcome,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling submission");
            kernel.cancel_all();
            submission.await
        }
    };

    let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    loop {
        match events.try_recv() {
            Ok(event) => *counts.entry(event.event_type()).or_default() += 1,
            Err(TryRecvError::Lagged(skipped)) => warn!(skipped, "Event stream lagged"),
            Err(_) => break,
        }
    }

    if let Some(sink) = &jsonl {
        sink.close().await;
    }

    match format {
        OutputFormat::Json => print_json(&outcome, total)?,
        OutputFormat::Text => {
            print_text(&outcome, total);
            if verbose {
                println!();
                println!("Events:");
                for (kind, count) in &counts {
                    println!("  {:<26} {}", kind, count);
                }
            }
            if let Some(path) = &audit_path {
                println!("Audit: {}", path.display());
            }
        }
    }

    match outcome {
        Err(e) => Err(eyre::Report::new(e).wrap_err("Submission failed")),
        Ok(_) => Ok(()),
    }
}

fn print_json(outcome: &Result<CellOutcome, KernelError>, total: Budget) -> Result<()> {
    let json = match outcome {
        Ok(outcome) => serde_json::json!({ "budget": total, "outcome": outcome }),
        Err(e) => serde_json::json!({
            "budget": total,
            "error": e.to_string(),
            "category": format!("{:?}", e.category()),
        }),
    };
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

fn print_text(outcome: &Result<CellOutcome, KernelError>, total: Budget) {
    match outcome {
        Ok(CellOutcome::Result(result)) => {
            let headline = format!("Completed {} ({})", result.task_id, result.mode);
            if result.degraded {
                println!("{} {}", "⚠".yellow(), headline.yellow());
            } else {
                println!("{} {}", "✓".green(), headline.green());
            }
            println!("  Confidence: {:.2}", result.confidence);
            println!("  Spent:      {} of {}", result.consumed, total);
            if result.rounds > 0 {
                println!("  Rounds:     {}", result.rounds);
            }
            if result.degraded {
                println!("  {}", "Degraded: some subtasks were not accepted".yellow());
            }

            if !result.conflicts.is_empty() {
                println!();
                println!("Conflicts:");
                for report in &result.conflicts {
                    match &report.resolution {
                        Resolution::Resolved { rule, rationale, .. } => println!(
                            "  {} vs {}: resolved by {} ({})",
                            report.subtasks[0], report.subtasks[1], rule, rationale
                        ),
                        Resolution::Unresolved { reason } => println!(
                            "  {} vs {}: {} ({})",
                            report.subtasks[0],
                            report.subtasks[1],
                            "unresolved".red(),
                            reason
                        ),
                    }
                }
            }

            if !result.trail.is_empty() {
                println!();
                println!("Escalations:");
                for escalation in &result.trail {
                    println!("  [{}] {}: {}", escalation.kind, escalation.task_id, escalation.reason);
                }
            }

            println!();
            println!("{}", result.output);
        }
        Ok(CellOutcome::Escalation(escalation)) => {
            println!(
                "{} {}",
                "✗".red(),
                format!("Escalated {} ({})", escalation.task_id, escalation.kind).red()
            );
            println!("  Reason: {}", escalation.reason);
            if let Some(partial) = &escalation.partial {
                println!();
                println!("Best partial (confidence {:.2}):", partial.confidence);
                println!("{}", partial.output);
            }
        }
        Err(e) => println!("{} {}", "✗".red(), format!("Failed: {}", e).red()),
    }
}

/// Check that every plan in a scenario is valid
fn cmd_validate(path: &Path) -> Result<()> {
    let scenario = load_scenario(path)?;
    let plans = scenario
        .tasks
        .values()
        .filter(|t| t.mode == Mode::Delegate)
        .count();
    println!(
        "{} {}: {} tasks, {} plans valid",
        "✓".green(),
        path.display(),
        scenario.tasks.len(),
        plans
    );
    Ok(())
}

/// Print the effective configuration
fn cmd_config(config: &Config) -> Result<()> {
    let yaml = serde_yaml::to_string(config).context("Failed to serialize config")?;
    print!("{}", yaml);
    Ok(())
}
