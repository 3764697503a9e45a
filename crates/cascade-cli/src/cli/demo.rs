//! Example ETL workflow executed against the configured database.
//!
//! ```text
//! extract -> transform -> load -> report
//!        \-> cleanup (one_failed)
//! ```
//!
//! `extract` retries with exponential backoff; `--fail-extract` makes every
//! attempt fail, so `cleanup` runs and `transform`/`load` are skipped.
//! `report` is `none_failed` and still runs over the skipped chain.

use std::time::Duration;

use anyhow::Result;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use cascade_core::registry::{TaskRegistry, build_workflow, register_task};
use cascade_core::runner::{RunResult, Runner, RunnerConfig};
use cascade_core::task::{TaskError, task_fn};
use cascade_core::Context;
use cascade_types::workflow::{RetryPolicy, TriggerRule};

use super::{short_id, task_status_cell};
use crate::state::AppState;

pub const DEMO_WORKFLOW: &str = "etl-demo";

/// Register the demo tasks and workflow in the global registry.
fn register_demo(fail_extract: bool) -> Result<()> {
    register_task(
        "extract",
        Vec::<String>::new(),
        TriggerRule::AllSuccess,
        RetryPolicy::exponential(2, Duration::from_millis(100)),
        task_fn(move |mut ctx: Context| async move {
            if fail_extract {
                return Err(TaskError::failed("source unavailable"));
            }
            ctx.set("rows", serde_json::json!([3, 5, 8]));
            Ok(ctx)
        }),
    )?;
    register_task(
        "transform",
        ["extract"],
        TriggerRule::AllSuccess,
        RetryPolicy::none(),
        task_fn(|mut ctx: Context| async move {
            let rows: Vec<i64> = ctx
                .get_as("rows")?
                .ok_or_else(|| TaskError::failed("no rows extracted"))?;
            ctx.set("total", rows.iter().sum::<i64>());
            Ok(ctx)
        }),
    )?;
    register_task(
        "load",
        ["transform"],
        TriggerRule::AllSuccess,
        RetryPolicy::fixed(1, Duration::from_millis(50)),
        task_fn(|mut ctx: Context| async move {
            ctx.set("loaded", true);
            Ok(ctx)
        }),
    )?;
    register_task(
        "report",
        ["load"],
        TriggerRule::NoneFailed,
        RetryPolicy::none(),
        task_fn(|mut ctx: Context| async move {
            let total: i64 = ctx.get_as("total")?.unwrap_or_default();
            ctx.set("report", format!("loaded {total} units"));
            Ok(ctx)
        }),
    )?;
    register_task(
        "cleanup",
        ["extract"],
        TriggerRule::OneFailed,
        RetryPolicy::none(),
        task_fn(|mut ctx: Context| async move {
            ctx.set("cleaned_up", true);
            Ok(ctx)
        }),
    )?;

    build_workflow(DEMO_WORKFLOW)
        .description("Extract, transform and load with a failure cleanup branch")
        .add_tasks(["extract", "transform", "load", "report", "cleanup"])
        .finalize()?;
    Ok(())
}

/// Register and execute the demo workflow, then print the result.
pub async fn run_demo(state: &AppState, fail_extract: bool, json: bool) -> Result<()> {
    register_demo(fail_extract)?;

    let runner = Runner::new(
        state.repo.clone(),
        TaskRegistry::global(),
        RunnerConfig::from(&state.config),
    );
    let seed: Context = [("requested_by", "cascade demo")].into_iter().collect();
    let result = runner.execute(DEMO_WORKFLOW, seed).await?;

    if json {
        print_json(&result)?;
    } else {
        print_result(&result);
    }
    Ok(())
}

fn print_json(result: &RunResult) -> Result<()> {
    let out = serde_json::json!({
        "run_id": result.run_id.to_string(),
        "workflow_name": result.workflow_name,
        "workflow_version": result.workflow_version,
        "status": result.status.as_str(),
        "context": result.context,
        "tasks": result
            .task_status
            .iter()
            .map(|(id, status)| (id.clone(), serde_json::json!(status.as_str())))
            .collect::<serde_json::Map<_, _>>(),
        "attempts": result.task_history,
        "error": result.error.as_ref().map(ToString::to_string),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn print_result(result: &RunResult) {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Task").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Attempts"),
        ]);
    for (task_id, status) in &result.task_status {
        let attempts = result.attempts_of(task_id).filter(|a| a.attempt > 0).count();
        table.add_row(vec![
            Cell::new(task_id),
            task_status_cell(*status),
            Cell::new(attempts),
        ]);
    }

    println!();
    println!(
        "  {} Run {} of '{}' ({})",
        style("*").green().bold(),
        style(short_id(&result.run_id)).cyan(),
        style(&result.workflow_name).cyan(),
        result.workflow_version
    );
    println!();
    println!("{table}");
    println!();
    println!("  Status: {}", result.status);
    if let Some(failure) = &result.error {
        println!("  Error: {}", style(failure).red());
    }
    println!("  Inspect with: cascade runs show {}", result.run_id);
    println!();
}
