//! Scheduler adapters
//!
//! One capability interface over the three ways a site can run the job:
//! a detached process on the host, a SLURM batch job or a PBS batch job.
//! Site runners only ever talk to `dyn SchedulerAdapter`; the concrete
//! adapter is picked from the site configuration by `AdapterFactory`.

mod direct;
#[cfg(test)]
pub mod memory;
mod pbs;
pub mod shell;
mod slurm;

pub use direct::DirectAdapter;
pub use pbs::PbsAdapter;
pub use slurm::SlurmAdapter;

use async_trait::async_trait;
use fanout_core::domain::site::{SchedulerKind, Site};
use fanout_core::error::{CancellationError, PollError, SubmissionError};
use std::sync::Arc;
use tracing::debug;

use crate::work_area::{ENDED_MARKER, RUN_SCRIPT, WorkArea};
use shell::Shell;

/// What to submit
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Script file name, relative to the work area
    pub script: String,
    /// Name shown by the scheduler
    pub name: String,
}

impl JobSpec {
    pub fn for_site(site: &Site) -> Self {
        Self {
            script: RUN_SCRIPT.to_string(),
            name: format!("fanout-{}", site.id),
        }
    }
}

/// Scheduler-assigned identifier of a submitted job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub id: String,
}

impl JobHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Where a submitted job stands, as far as the scheduler can tell
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    /// Queued, held or executing
    Running,
    Succeeded,
    Failed {
        exit_code: Option<i32>,
        reason: String,
    },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Running)
    }

    fn failed(exit_code: Option<i32>, reason: impl Into<String>) -> Self {
        JobState::Failed {
            exit_code,
            reason: reason.into(),
        }
    }
}

/// Submit, observe and cancel a job on one site
#[async_trait]
pub trait SchedulerAdapter: Send + Sync {
    /// Submits the job and returns the scheduler's identifier for it
    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, SubmissionError>;

    /// Queries the current state of a submitted job
    async fn poll(&self, handle: &JobHandle) -> Result<JobState, PollError>;

    /// Cancels the job; a job that already finished is left alone
    async fn cancel(&self, handle: &JobHandle) -> Result<(), CancellationError>;

    /// Whether the job has reached a terminal state
    async fn is_terminal(&self, handle: &JobHandle) -> Result<bool, PollError> {
        Ok(self.poll(handle).await?.is_terminal())
    }
}

/// Picks the adapter for a site
pub trait AdapterFactory: Send + Sync {
    fn adapter_for(&self, site: &Site, area: &WorkArea) -> Arc<dyn SchedulerAdapter>;
}

/// Production factory: one adapter per scheduler kind
#[derive(Debug, Default, Clone, Copy)]
pub struct SchedulerAdapters;

impl AdapterFactory for SchedulerAdapters {
    fn adapter_for(&self, site: &Site, area: &WorkArea) -> Arc<dyn SchedulerAdapter> {
        let shell = Shell::new(&site.resource, area.path());

        debug!(
            "Using {} adapter for {} ({})",
            site.kind,
            site.id,
            if shell.is_remote() { "remote" } else { "local" }
        );

        match site.kind {
            SchedulerKind::Direct => Arc::new(DirectAdapter::new(shell)),
            SchedulerKind::Slurm => Arc::new(SlurmAdapter::new(shell)),
            SchedulerKind::Pbs => Arc::new(PbsAdapter::new(shell)),
        }
    }
}

/// Reads the `job.ended` marker written by the run script
///
/// `Ok(None)` means the marker does not exist yet.
async fn read_ended_marker(shell: &Shell) -> Result<Option<JobState>, PollError> {
    let command = format!(
        "if [ -f {0} ]; then cat {0}; else exit 3; fi",
        ENDED_MARKER
    );

    let output = shell.run(&command).await.map_err(|source| PollError::Launch {
        command: command.clone(),
        source,
    })?;

    match output.exit_code {
        0 => Ok(parse_ended_marker(&output.stdout)),
        3 => Ok(None),
        code => Err(PollError::Query {
            command,
            message: format!("exit code {}: {}", code, output.stderr.trim()),
        }),
    }
}

/// Marker content is the script's exit code
///
/// An empty marker is still being written and reads as `None`.
fn parse_ended_marker(content: &str) -> Option<JobState> {
    let content = content.trim();

    if content.is_empty() {
        return None;
    }

    let state = match content.parse::<i32>() {
        Ok(0) => JobState::Succeeded,
        Ok(code) => JobState::failed(Some(code), format!("exited with code {}", code)),
        Err(_) => JobState::failed(None, format!("job ended: {}", content)),
    };
    Some(state)
}

/// Leading ASCII digits of `line`, if any
fn leading_number(line: &str) -> Option<&str> {
    let line = line.trim_start();
    let len = line.bytes().take_while(u8::is_ascii_digit).count();
    (len > 0).then(|| &line[..len])
}

/// Trailing ASCII digits of `line`, if any
fn trailing_number(line: &str) -> Option<&str> {
    let line = line.trim_end();
    let len = line.bytes().rev().take_while(u8::is_ascii_digit).count();
    (len > 0).then(|| &line[line.len() - len..])
}

/// Shared fallback for cancel commands that failed
///
/// If the job is already over the failure is expected and swallowed,
/// otherwise it is reported.
async fn cancel_failed<A>(
    adapter: &A,
    handle: &JobHandle,
    command: String,
    stderr: String,
) -> Result<(), CancellationError>
where
    A: SchedulerAdapter + ?Sized,
{
    match adapter.is_terminal(handle).await {
        Ok(true) => {
            debug!("Job {} already finished, nothing to cancel", handle.id);
            Ok(())
        }
        _ => Err(CancellationError::Rejected { command, stderr }),
    }
}

/// Writes an executable stand-in for a scheduler command into `bin`
#[cfg(test)]
pub(crate) fn stub_command(bin: &std::path::Path, name: &str, body: &str) {
    use std::os::unix::fs::PermissionsExt;

    std::fs::create_dir_all(bin).unwrap();
    let path = bin.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ended_marker() {
        assert_eq!(parse_ended_marker("0\n"), Some(JobState::Succeeded));
        assert_eq!(parse_ended_marker(""), None);
        assert_eq!(parse_ended_marker("\n"), None);
        assert_eq!(
            parse_ended_marker("2\n"),
            Some(JobState::Failed {
                exit_code: Some(2),
                reason: "exited with code 2".to_string()
            })
        );
        assert!(matches!(
            parse_ended_marker("cancelled"),
            Some(JobState::Failed { exit_code: None, .. })
        ));
    }

    #[test]
    fn test_number_extraction() {
        assert_eq!(trailing_number("Submitted batch job 4242"), Some("4242"));
        assert_eq!(trailing_number("Submitted batch job 4242\n"), Some("4242"));
        assert_eq!(trailing_number("no id here"), None);
        assert_eq!(leading_number("123.pbs-server"), Some("123"));
        assert_eq!(leading_number("  77\n"), Some("77"));
        assert_eq!(leading_number("qsub: error"), None);
    }

    #[tokio::test]
    async fn test_read_ended_marker() {
        let dir = tempfile::tempdir().unwrap();
        let shell = Shell::local(dir.path());

        assert_eq!(read_ended_marker(&shell).await.unwrap(), None);

        // truncated but not yet written
        std::fs::write(dir.path().join(ENDED_MARKER), "").unwrap();
        assert_eq!(read_ended_marker(&shell).await.unwrap(), None);

        std::fs::write(dir.path().join(ENDED_MARKER), "0\n").unwrap();
        assert_eq!(
            read_ended_marker(&shell).await.unwrap(),
            Some(JobState::Succeeded)
        );
    }
}
