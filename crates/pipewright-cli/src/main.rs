//! Pipewright CLI entry point.
//!
//! Binary name: `pwright`
//!
//! Parses CLI arguments, wires the file checkpoint store and the configured
//! action commands into an orchestrator, then dispatches to the command
//! handlers in `commands`.

mod commands;
mod render;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Run declarative development workflows.
#[derive(Parser)]
#[command(name = "pwright", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON (NDJSON events) instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors and final results.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Data directory (defaults to ~/.pipewright).
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a workflow file.
    Run {
        /// Path to the workflow YAML file.
        file: PathBuf,

        /// Workflow input as key=value (value parsed as JSON when possible).
        #[arg(short, long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,
    },

    /// Resume a checkpointed run of a workflow file.
    Resume {
        /// Run ID printed by the original `run` invocation.
        run_id: Uuid,

        /// Path to the same workflow YAML file.
        file: PathBuf,
    },

    /// Validate a workflow file without executing it.
    Validate {
        /// Path to the workflow YAML file.
        file: PathBuf,
    },

    /// List checkpointed runs.
    #[command(alias = "ls")]
    Runs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,pipewright=debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let data_dir = cli
        .data_dir
        .clone()
        .unwrap_or_else(pipewright_infra::config::default_data_dir);

    match cli.command {
        Commands::Run { file, inputs } => {
            commands::run(&data_dir, &file, &inputs, cli.json, cli.quiet).await
        }
        Commands::Resume { run_id, file } => {
            commands::resume(&data_dir, run_id, &file, cli.json, cli.quiet).await
        }
        Commands::Validate { file } => commands::validate(&file, cli.json),
        Commands::Runs => commands::list_runs(&data_dir, cli.json).await,
    }
}
