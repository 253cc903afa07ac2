//! Fanout
//!
//! Dispatches one job script onto several compute sites at once and
//! coordinates their outcome.
//!
//! Architecture:
//! - Configuration: JSON file with environment and flag overrides
//! - Adapters: direct, SLURM and PBS behind one scheduler interface
//! - Runner: one task per site driving the job state machine
//! - Arbiter: set-once winner slot for race mode
//! - Services: event log writer, output aggregator, summary reporter
//!
//! In race mode the first site to succeed wins and every other site is
//! cancelled; in parallel mode every site runs to completion.

mod adapter;
mod arbiter;
mod commands;
mod config;
mod coordinator;
mod runner;
mod script;
mod service;
mod work_area;

use clap::Parser;
use colored::*;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::commands::{Commands, handle_command};

#[derive(Parser)]
#[command(name = "fanout")]
#[command(about = "Run one job on many compute sites", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fanout_runner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match handle_command(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
