//! Summary reporting
//!
//! Runs once every site runner has returned, whatever their outcome, and
//! persists `summary.json`. The reporter owns the output aggregator's stop
//! signal: dropping it stops the aggregator, so the stream ends even when
//! writing the summary fails.

use anyhow::{Context, Result};
use fanout_core::domain::execution::{ExecutionMode, Summary};
use fanout_core::domain::job::Job;
use fanout_core::domain::site::{Site, SiteId};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Raises the stop signal when dropped
pub struct StopOnDrop(watch::Sender<bool>);

impl StopOnDrop {
    pub fn new(stop: watch::Sender<bool>) -> Self {
        Self(stop)
    }
}

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

pub struct SummaryReporter {
    path: Option<PathBuf>,
    _stop: StopOnDrop,
}

impl SummaryReporter {
    /// `path` receives the summary; `stop` is raised when the reporter goes
    pub fn new(path: Option<PathBuf>, stop: watch::Sender<bool>) -> Self {
        Self {
            path,
            _stop: StopOnDrop::new(stop),
        }
    }

    /// Tallies the final statuses and persists them
    ///
    /// Sites missing from `jobs` count as failed.
    pub fn report(
        self,
        execution_id: &str,
        mode: ExecutionMode,
        winner: Option<SiteId>,
        sites: &[Site],
        jobs: &HashMap<SiteId, Job>,
    ) -> Summary {
        let summary = Summary::tally(
            execution_id,
            mode,
            winner,
            sites.iter().map(|site| (site, jobs.get(&site.id))),
        );

        info!(
            "Execution {} finished: {} completed, {} failed, {} cancelled",
            summary.execution_id, summary.completed, summary.failed, summary.cancelled
        );

        if let Some(path) = &self.path {
            match write_summary(path, &summary) {
                Ok(()) => debug!("Summary written to {}", path.display()),
                Err(e) => error!("Failed to write summary: {:#}", e),
            }
        }

        summary
    }
}

fn write_summary(path: &Path, summary: &Summary) -> Result<()> {
    let json = serde_json::to_string_pretty(summary).context("Failed to serialize summary")?;
    std::fs::write(path, json + "\n")
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Reads a stored `summary.json`
pub fn load_summary(path: &Path) -> Result<Summary> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read summary {}", path.display()))?;

    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse summary {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_core::domain::job::JobStatus;

    fn finished(site: &Site, status: JobStatus) -> Job {
        let mut job = Job::new(site.id.clone());
        job.transition(JobStatus::Submitting).unwrap();
        if status != JobStatus::Failed {
            job.transition(JobStatus::Running).unwrap();
        }
        job.transition(status).unwrap();
        job
    }

    #[test]
    fn test_report_persists_and_stops_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.json");
        let (stop_tx, stop_rx) = watch::channel(false);

        let sites: Vec<Site> = (0..3).map(|i| Site::direct(i, format!("Site-{}", i))).collect();
        let mut jobs = HashMap::new();
        jobs.insert(sites[0].id.clone(), finished(&sites[0], JobStatus::Cancelled));
        jobs.insert(sites[1].id.clone(), finished(&sites[1], JobStatus::Completed));
        // sites[2] never reported

        let reporter = SummaryReporter::new(Some(path.clone()), stop_tx);
        let summary = reporter.report(
            "exec-1",
            ExecutionMode::Race,
            Some(sites[1].id.clone()),
            &sites,
            &jobs,
        );

        assert!(*stop_rx.borrow());
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.cancelled, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.total(), sites.len());

        let stored = load_summary(&path).unwrap();
        assert_eq!(stored.winner, Some(SiteId::from_index(1)));
        assert_eq!(stored.execution_id, "exec-1");
    }

    #[test]
    fn test_unwritable_summary_still_stops_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("summary.json");
        let (stop_tx, stop_rx) = watch::channel(false);

        let site = Site::direct(0, "Site-0");
        let mut jobs = HashMap::new();
        jobs.insert(site.id.clone(), finished(&site, JobStatus::Completed));

        let summary = SummaryReporter::new(Some(path.clone()), stop_tx).report(
            "exec-2",
            ExecutionMode::Parallel,
            None,
            std::slice::from_ref(&site),
            &jobs,
        );

        assert!(summary.is_success());
        assert!(!path.exists());
        assert!(*stop_rx.borrow());
    }
}
