//! Printing of summaries and event logs

use anyhow::Result;
use colored::*;
use fanout_core::domain::event::Event;
use fanout_core::domain::execution::Summary;
use fanout_core::domain::job::JobStatus;
use std::path::Path;
use std::process::ExitCode;

use crate::service::{load_summary, read_events};
use crate::work_area::CoordinationRoot;

pub fn show_summary(dir: &Path) -> Result<ExitCode> {
    let root = CoordinationRoot::from_path(dir.to_path_buf());
    let summary = load_summary(&root.summary_path())?;

    print_summary(&summary);
    Ok(ExitCode::SUCCESS)
}

pub fn show_events(dir: &Path) -> Result<ExitCode> {
    let root = CoordinationRoot::from_path(dir.to_path_buf());
    let events = read_events(&root.events_path())?;

    if events.is_empty() {
        println!("{}", "No events recorded.".yellow());
        return Ok(ExitCode::SUCCESS);
    }

    println!("{}", format!("{} event(s):", events.len()).bold());
    println!("{}", "─".repeat(80).dimmed());
    for event in &events {
        print_event(event);
    }
    println!("{}", "─".repeat(80).dimmed());

    Ok(ExitCode::SUCCESS)
}

pub fn print_summary(summary: &Summary) {
    println!();
    println!("{}", "Execution Summary:".bold());
    println!("  ID:        {}", summary.execution_id.cyan());
    println!("  Mode:      {}", summary.mode);
    println!("  Completed: {}", summary.completed.to_string().green());
    println!("  Failed:    {}", summary.failed.to_string().red());
    println!("  Cancelled: {}", summary.cancelled.to_string().dimmed());

    match &summary.winner {
        Some(winner) => println!("  Winner:    {}", winner.to_string().green().bold()),
        None => println!("  Winner:    {}", "none".dimmed()),
    }

    println!("\n{}", "Sites:".bold());
    for site in &summary.sites {
        println!(
            "  {} {} ({}) {}",
            "▸".cyan(),
            site.name.bold(),
            site.site_id.to_string().dimmed(),
            colorize_status(site.status)
        );
        if let Some(job_id) = &site.job_id {
            println!("    Job:       {}", job_id.dimmed());
        }
        if let Some(code) = site.exit_code {
            println!("    Exit Code: {}", code);
        }
        if let Some(error) = &site.error_message {
            println!("    Error:     {}", error.red());
        }
    }

    println!();
    if summary.is_success() {
        println!("{}", "✓ Execution succeeded".green().bold());
    } else {
        println!("{}", "✗ Execution did not succeed".red().bold());
    }
}

fn print_event(event: &Event) {
    println!(
        "{} [{}] {}{}",
        event.timestamp.format("%H:%M:%S").to_string().dimmed(),
        event.site_id,
        colorize_status(event.status),
        event
            .message
            .as_deref()
            .map(|m| format!(" {}", m))
            .unwrap_or_default()
    );
}

/// Colorize job status for display
fn colorize_status(status: JobStatus) -> ColoredString {
    let status_str = status.to_string();
    match status {
        JobStatus::Pending | JobStatus::Submitting => status_str.yellow(),
        JobStatus::Running => status_str.cyan(),
        JobStatus::Completed => status_str.green(),
        JobStatus::Failed => status_str.red(),
        JobStatus::Cancelled => status_str.dimmed(),
    }
}
