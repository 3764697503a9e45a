//! CLI run inspection subcommands.
//!
//! Provides list, show, attempts, context, unfinished and cancel operations
//! over the runs persisted in the SQLite database.

use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use uuid::Uuid;

use cascade_core::registry::TaskRegistry;
use cascade_core::repository::run::RunRepository;
use cascade_core::runner::{Runner, RunnerConfig};
use cascade_types::workflow::{RunRecord, TaskAttempt, WorkflowRun};

use super::{run_status_cell, short_id, task_status_cell};
use crate::state::AppState;

/// Run inspection subcommands.
#[derive(Subcommand)]
pub enum RunsCommand {
    /// List recent runs, newest first.
    #[command(alias = "ls")]
    List {
        /// Only runs of this workflow.
        #[arg(long, short)]
        workflow: Option<String>,

        /// Maximum number of runs to display (defaults to `list_limit` from config.toml).
        #[arg(long)]
        limit: Option<u32>,
    },

    /// Show a run with the current state of each task.
    Show {
        /// Run UUID.
        run_id: String,
    },

    /// Show the attempt history of a run.
    Attempts {
        /// Run UUID.
        run_id: String,

        /// Only attempts of this task.
        #[arg(long, short)]
        task: Option<String>,
    },

    /// Print the latest context snapshot of a run as JSON.
    Context {
        /// Run UUID.
        run_id: String,
    },

    /// List runs that never reached a terminal status.
    Unfinished,

    /// Mark a run as cancelled.
    Cancel {
        /// Run UUID.
        run_id: String,
    },
}

/// Handle a runs subcommand.
pub async fn handle_runs_command(cmd: RunsCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        RunsCommand::List { workflow, limit } => {
            let limit = limit.unwrap_or(state.config.list_limit);
            handle_list(workflow.as_deref(), limit, state, json).await
        }
        RunsCommand::Show { run_id } => handle_show(&parse_run_id(&run_id)?, &state.repo, json).await,
        RunsCommand::Attempts { run_id, task } => {
            handle_attempts(&parse_run_id(&run_id)?, task.as_deref(), &state.repo, json).await
        }
        RunsCommand::Context { run_id } => handle_context(&parse_run_id(&run_id)?, &state.repo).await,
        RunsCommand::Unfinished => handle_unfinished(&state.repo, json).await,
        RunsCommand::Cancel { run_id } => handle_cancel(parse_run_id(&run_id)?, state, json).await,
    }
}

fn parse_run_id(raw: &str) -> Result<Uuid> {
    raw.parse::<Uuid>()
        .with_context(|| format!("'{raw}' is not a valid run ID"))
}

async fn load_record(run_id: &Uuid, repo: &impl RunRepository) -> Result<RunRecord> {
    repo.load_run(run_id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load run: {e}"))?
        .ok_or_else(|| anyhow::anyhow!("Run {run_id} not found"))
}

fn run_json(run: &WorkflowRun) -> serde_json::Value {
    serde_json::json!({
        "run_id": run.id.to_string(),
        "workflow_name": run.workflow_name,
        "workflow_version": run.workflow_version,
        "status": run.status.as_str(),
        "created_at": run.created_at.to_rfc3339(),
        "started_at": run.started_at.map(|t| t.to_rfc3339()),
        "completed_at": run.completed_at.map(|t| t.to_rfc3339()),
        "error": run.error,
    })
}

fn runs_table(runs: &[WorkflowRun]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run ID").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Version"),
            Cell::new("Status"),
            Cell::new("Created"),
            Cell::new("Completed"),
        ]);

    for r in runs {
        let completed = r
            .completed_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(short_id(&r.id)),
            Cell::new(&r.workflow_name),
            Cell::new(&r.workflow_version),
            run_status_cell(r.status),
            Cell::new(r.created_at.format("%Y-%m-%d %H:%M").to_string()),
            Cell::new(completed),
        ]);
    }
    table
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

async fn handle_list(workflow: Option<&str>, limit: u32, state: &AppState, json: bool) -> Result<()> {
    let runs = state
        .repo
        .list_runs(workflow, limit)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to list runs: {e}"))?;

    if json {
        let out: Vec<_> = runs.iter().map(run_json).collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!();
        match workflow {
            Some(name) => println!("  No runs for workflow '{name}'."),
            None => println!("  No runs recorded in {}.", state.data_dir.display()),
        }
        println!();
        return Ok(());
    }

    println!();
    println!("{}", runs_table(&runs));
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Show
// ---------------------------------------------------------------------------

async fn handle_show(run_id: &Uuid, repo: &impl RunRepository, json: bool) -> Result<()> {
    let record = load_record(run_id, repo).await?;
    let run = &record.run;

    if json {
        let tasks: Vec<_> = record
            .tasks
            .iter()
            .map(|t| {
                serde_json::json!({
                    "task_id": t.task_id,
                    "status": t.status.as_str(),
                    "attempts": t.attempts,
                    "updated_at": t.updated_at.to_rfc3339(),
                })
            })
            .collect();
        let mut out = run_json(run);
        out["tasks"] = serde_json::Value::Array(tasks);
        out["snapshot_sequence"] = serde_json::json!(record.latest_snapshot.as_ref().map(|s| s.sequence));
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Run {}",
        style("Workflow:").bold(),
        style(short_id(&run.id)).cyan()
    );
    println!("  Workflow: {} ({})", style(&run.workflow_name).cyan(), run.workflow_version);
    println!("  Status: {}", run.status);
    println!("  Created: {}", run.created_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(started) = run.started_at {
        println!("  Started: {}", started.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(completed) = run.completed_at {
        println!("  Completed: {}", completed.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(ref err) = run.error {
        println!("  Error: {}", style(err).red());
    }
    if let Some(snapshot) = &record.latest_snapshot {
        println!("  Last checkpoint: {} (#{})", snapshot.checkpoint, snapshot.sequence);
    }

    if !record.tasks.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("Task").fg(Color::Cyan),
                Cell::new("Status"),
                Cell::new("Attempts"),
                Cell::new("Updated"),
            ]);
        for t in &record.tasks {
            table.add_row(vec![
                Cell::new(&t.task_id),
                task_status_cell(t.status),
                Cell::new(t.attempts),
                Cell::new(t.updated_at.format("%H:%M:%S").to_string()),
            ]);
        }
        println!();
        println!("{table}");
    }
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Attempts
// ---------------------------------------------------------------------------

fn attempt_duration(attempt: &TaskAttempt) -> String {
    attempt
        .completed_at
        .map(|done| format!("{}ms", (done - attempt.started_at).num_milliseconds()))
        .unwrap_or_else(|| "-".to_string())
}

async fn handle_attempts(run_id: &Uuid, task: Option<&str>, repo: &impl RunRepository, json: bool) -> Result<()> {
    if repo
        .get_run(run_id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load run: {e}"))?
        .is_none()
    {
        bail!("Run {run_id} not found");
    }
    let attempts: Vec<TaskAttempt> = repo
        .list_attempts(run_id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to list attempts: {e}"))?
        .into_iter()
        .filter(|a| task.is_none_or(|t| a.task_id == t))
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&attempts)?);
        return Ok(());
    }

    if attempts.is_empty() {
        println!();
        println!("  No attempts recorded.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Task").fg(Color::Cyan),
            Cell::new("#"),
            Cell::new("Status"),
            Cell::new("Started"),
            Cell::new("Duration"),
            Cell::new("Error"),
        ]);
    for a in &attempts {
        let number = if a.attempt == 0 { "-".to_string() } else { a.attempt.to_string() };
        table.add_row(vec![
            Cell::new(&a.task_id),
            Cell::new(number),
            task_status_cell(a.status),
            Cell::new(a.started_at.format("%H:%M:%S%.3f").to_string()),
            Cell::new(attempt_duration(a)),
            Cell::new(a.error.as_deref().unwrap_or("")),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

async fn handle_context(run_id: &Uuid, repo: &impl RunRepository) -> Result<()> {
    let snapshot = repo
        .latest_snapshot(run_id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load snapshot: {e}"))?
        .ok_or_else(|| anyhow::anyhow!("No context snapshot for run {run_id}"))?;

    let context: serde_json::Value = serde_json::from_str(&snapshot.context)
        .context("Stored context snapshot is not valid JSON")?;
    println!("{}", serde_json::to_string_pretty(&context)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Unfinished
// ---------------------------------------------------------------------------

async fn handle_unfinished(repo: &impl RunRepository, json: bool) -> Result<()> {
    let runs = repo
        .list_unfinished_runs()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to list runs: {e}"))?;

    if json {
        let out: Vec<_> = runs.iter().map(run_json).collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    if runs.is_empty() {
        println!("  {} No unfinished runs.", style("*").green().bold());
    } else {
        println!(
            "  {} {} unfinished run(s); resume them from the process that registered their tasks.",
            style("!").yellow().bold(),
            runs.len()
        );
        println!();
        println!("{}", runs_table(&runs));
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

async fn handle_cancel(run_id: Uuid, state: &AppState, json: bool) -> Result<()> {
    // No tasks are needed to mark a run cancelled. A process executing the
    // run stops at its next status write.
    let runner = Runner::new(
        state.repo.clone(),
        Arc::new(TaskRegistry::new()),
        RunnerConfig::from(&state.config),
    );
    let cancelled = runner
        .cancel(run_id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to cancel run: {e}"))?;

    if json {
        let out = serde_json::json!({
            "run_id": run_id.to_string(),
            "cancelled": cancelled,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    if cancelled {
        println!("  {} Cancelled run {}", style("*").green().bold(), style(short_id(&run_id)).cyan());
    } else {
        println!(
            "  {} Run {} had already finished",
            style("-").dim(),
            style(short_id(&run_id)).cyan()
        );
    }
    println!();
    Ok(())
}
