//! Commands module
//!
//! Defines the CLI commands and their handlers.

mod inspect;
mod run;

pub use run::RunArgs;

use anyhow::Result;
use clap::Subcommand;
use std::path::PathBuf;
use std::process::ExitCode;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Dispatch the job to every enabled site
    Run(RunArgs),
    /// Print the stored summary of an execution
    Summary {
        /// Coordination directory (`<rundir>/lb_<execution_id>`)
        coordination_dir: PathBuf,
    },
    /// Print the event log of an execution
    Events {
        /// Coordination directory (`<rundir>/lb_<execution_id>`)
        coordination_dir: PathBuf,
    },
}

/// Routes the command to its handler
///
/// Returns the process exit code: 0 on success, 1 when the execution was
/// refused before dispatch, 2 when it ran without success.
pub async fn handle_command(command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Run(args) => run::run(args).await,
        Commands::Summary { coordination_dir } => inspect::show_summary(&coordination_dir),
        Commands::Events { coordination_dir } => inspect::show_events(&coordination_dir),
    }
}
