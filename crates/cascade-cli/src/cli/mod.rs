//! CLI command definitions for the `cascade` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod demo;
pub mod runs;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use comfy_table::{Cell, Color};

use cascade_types::workflow::{RunStatus, TaskStatus};

/// Inspect and manage Cascade workflow runs.
#[derive(Parser)]
#[command(name = "cascade", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, short, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit log events as JSON lines on stderr.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true, env = "CASCADE_OTEL")]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect persisted runs.
    Runs {
        #[command(subcommand)]
        action: runs::RunsCommand,
    },

    /// Execute the bundled example ETL workflow.
    Demo {
        /// Make the extract task fail on every attempt.
        #[arg(long)]
        fail_extract: bool,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

// ---------------------------------------------------------------------------
// Shared formatting
// ---------------------------------------------------------------------------

pub(crate) fn run_status_cell(status: RunStatus) -> Cell {
    let color = match status {
        RunStatus::Pending => Color::Grey,
        RunStatus::Running => Color::Yellow,
        RunStatus::Completed => Color::Green,
        RunStatus::Failed => Color::Red,
        RunStatus::Cancelled => Color::DarkYellow,
    };
    Cell::new(status.as_str()).fg(color)
}

pub(crate) fn task_status_cell(status: TaskStatus) -> Cell {
    let color = match status {
        TaskStatus::Pending => Color::Grey,
        TaskStatus::Running => Color::Yellow,
        TaskStatus::Succeeded => Color::Green,
        TaskStatus::Failed => Color::Red,
        TaskStatus::Skipped => Color::DarkGrey,
    };
    Cell::new(status.as_str()).fg(color)
}

pub(crate) fn short_id(id: &uuid::Uuid) -> String {
    id.to_string().chars().take(8).collect()
}
