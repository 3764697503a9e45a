//! Cascade CLI entry point.
//!
//! Binary name: `cascade`
//!
//! Parses CLI arguments, initializes tracing and the database, then
//! dispatches to the command handler.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;

use cascade_observe::tracing_setup::{LogFormat, TracingOptions, init_tracing, shutdown_tracing};
use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let format = if cli.log_json { LogFormat::Json } else { LogFormat::Pretty };
    let options = TracingOptions::from_verbosity(cli.verbose, cli.quiet)
        .format(format)
        .with_otel(cli.otel);
    init_tracing(&options).map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "cascade", &mut std::io::stdout());
        return Ok(());
    }

    let state = AppState::init().await?;

    let result = match cli.command {
        Commands::Runs { action } => cli::runs::handle_runs_command(action, &state, cli.json).await,
        Commands::Demo { fail_extract } => cli::demo::run_demo(&state, fail_extract, cli.json).await,
        Commands::Completions { .. } => unreachable!("handled above"),
    };

    shutdown_tracing();
    result
}
