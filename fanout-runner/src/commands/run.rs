//! `fanout run`

use anyhow::Result;
use chrono::Utc;
use clap::Args;
use colored::*;
use fanout_core::domain::execution::ExecutionMode;
use fanout_core::domain::site::SiteId;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::inspect::print_summary;
use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::service::{OutputSink, TaggedLine};

#[derive(Args)]
pub struct RunArgs {
    /// Configuration file
    #[arg(short, long, env = "FANOUT_CONFIG")]
    config: PathBuf,

    /// Execution mode, overrides the configuration
    #[arg(long)]
    mode: Option<ExecutionMode>,

    /// Poll interval in seconds, overrides the configuration
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Reuse a coordination root, defaults to a fresh id
    #[arg(long)]
    execution_id: Option<String>,

    /// Directory that receives the coordination root
    #[arg(long)]
    rundir: Option<PathBuf>,

    /// Do not stream site output
    #[arg(short, long)]
    quiet: bool,
}

pub async fn run(args: RunArgs) -> Result<ExitCode> {
    let mut config = Config::load(&args.config)?;
    config.apply_env();

    if let Some(mode) = args.mode {
        config.execution_mode = mode;
    }
    if let Some(secs) = args.poll_interval {
        config.poll_interval = secs;
    }
    if let Some(rundir) = args.rundir {
        config.rundir = rundir;
    }

    let execution_id = args
        .execution_id
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

    let coordinator = match config.into_plan(execution_id) {
        Ok(plan) => Coordinator::new(plan),
        Err(e) => return Ok(refuse(e)),
    };

    let execution = match coordinator.initialize() {
        Ok(execution) => execution,
        Err(e) => return Ok(refuse(e)),
    };

    println!(
        "{} {} site(s), coordination root {}",
        "Dispatching to".bold(),
        execution.sites().len(),
        execution.root().path().display()
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling every site");
            shutdown_tx.send_replace(true);
        }
    });

    let started = Utc::now();
    let summary = coordinator
        .run(execution, shutdown_rx, ConsoleSink::new(args.quiet))
        .await;

    print_summary(&summary);
    let elapsed = Utc::now().signed_duration_since(started).num_seconds();
    println!("{}", format!("Finished in {}s", elapsed).dimmed());

    if summary.is_success() {
        info!("Execution {} succeeded", summary.execution_id);
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(2))
    }
}

fn refuse(e: impl std::fmt::Display) -> ExitCode {
    error!("Execution refused: {}", e);
    eprintln!("{} {}", "✗".red(), e.to_string().red());
    ExitCode::from(1)
}

const PALETTE: [Color; 6] = [
    Color::Cyan,
    Color::Magenta,
    Color::Yellow,
    Color::Blue,
    Color::Green,
    Color::BrightRed,
];

/// Prints tagged site output, one color per site
struct ConsoleSink {
    quiet: bool,
    colors: HashMap<SiteId, Color>,
}

impl ConsoleSink {
    fn new(quiet: bool) -> Self {
        Self {
            quiet,
            colors: HashMap::new(),
        }
    }
}

impl OutputSink for ConsoleSink {
    fn emit(&mut self, line: TaggedLine) {
        if self.quiet {
            return;
        }

        let next = PALETTE[self.colors.len() % PALETTE.len()];
        let color = *self.colors.entry(line.site_id).or_insert(next);

        println!("{} {}", format!("[{}]", line.label).color(color), line.line);
    }
}
