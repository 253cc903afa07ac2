//! Execution-wide types: policy and final summary

use serde::{Deserialize, Serialize};

use crate::domain::job::{Job, JobStatus};
use crate::domain::site::{Site, SiteId};

/// How the outcomes of the sites relate to each other
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// First site to succeed wins, every other site is cancelled
    #[default]
    Race,
    /// Every site runs to completion on its own
    Parallel,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Race => write!(f, "race"),
            ExecutionMode::Parallel => write!(f, "parallel"),
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "race" => Ok(ExecutionMode::Race),
            "parallel" => Ok(ExecutionMode::Parallel),
            other => Err(format!(
                "unknown execution mode '{}' (expected race or parallel)",
                other
            )),
        }
    }
}

/// Final state of one site as it appears in the summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteOutcome {
    pub site_id: SiteId,
    pub name: String,
    pub priority: i32,
    pub status: JobStatus,
    pub job_id: Option<String>,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
}

/// Summary record written once every site is terminal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub execution_id: String,
    pub mode: ExecutionMode,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub winner: Option<SiteId>,
    #[serde(default)]
    pub sites: Vec<SiteOutcome>,
}

impl Summary {
    /// Tallies terminal statuses over every enabled site
    ///
    /// A site with no job record, or one whose record never reached a
    /// terminal state, counts as failed so the three counts always add up to
    /// the number of sites. Outcomes are listed by priority, then index.
    pub fn tally<'a, I>(
        execution_id: impl Into<String>,
        mode: ExecutionMode,
        winner: Option<SiteId>,
        sites: I,
    ) -> Self
    where
        I: IntoIterator<Item = (&'a Site, Option<&'a Job>)>,
    {
        let mut outcomes: Vec<(usize, SiteOutcome)> = sites
            .into_iter()
            .map(|(site, job)| {
                let status = job
                    .map(|j| j.status)
                    .filter(|s| s.is_terminal())
                    .unwrap_or(JobStatus::Failed);

                let error_message = match job {
                    Some(j) if j.is_terminal() => j.error_message.clone(),
                    Some(j) => Some(format!("runner stopped while {}", j.status)),
                    None => Some("no job record".to_string()),
                };

                (
                    site.index,
                    SiteOutcome {
                        site_id: site.id.clone(),
                        name: site.name.clone(),
                        priority: site.priority,
                        status,
                        job_id: job.and_then(|j| j.job_id.clone()),
                        exit_code: job.and_then(|j| j.exit_code),
                        error_message,
                    },
                )
            })
            .collect();

        outcomes.sort_by_key(|(index, outcome)| (outcome.priority, *index));

        let count = |status: JobStatus| {
            outcomes
                .iter()
                .filter(|(_, outcome)| outcome.status == status)
                .count()
        };

        Self {
            execution_id: execution_id.into(),
            mode,
            completed: count(JobStatus::Completed),
            failed: count(JobStatus::Failed),
            cancelled: count(JobStatus::Cancelled),
            winner: match mode {
                ExecutionMode::Race => winner,
                ExecutionMode::Parallel => None,
            },
            sites: outcomes.into_iter().map(|(_, outcome)| outcome).collect(),
        }
    }

    pub fn total(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }

    /// Race: a winner exists. Parallel: nothing failed or got cancelled.
    pub fn is_success(&self) -> bool {
        match self.mode {
            ExecutionMode::Race => self.winner.is_some(),
            ExecutionMode::Parallel => self.completed > 0 && self.completed == self.total(),
        }
    }
}
