//! SLURM adapter
//!
//! Submission goes through `sbatch`, status through `squeue`, cancellation
//! through `scancel`. The `job.ended` marker is checked before asking the
//! scheduler, so injected markers win over the queue state.

use async_trait::async_trait;
use fanout_core::error::{CancellationError, PollError, SubmissionError};
use tracing::{debug, info, warn};

use super::shell::{Shell, quote};
use super::{
    JobHandle, JobSpec, JobState, SchedulerAdapter, cancel_failed, read_ended_marker,
    trailing_number,
};

/// Job states after which SLURM will not run the job any further
const FAILED_STATES: &[&str] = &[
    "BOOT_FAIL",
    "CANCELLED",
    "DEADLINE",
    "FAILED",
    "NODE_FAIL",
    "OUT_OF_MEMORY",
    "PREEMPTED",
    "REVOKED",
    "TIMEOUT",
];

pub struct SlurmAdapter {
    shell: Shell,
}

impl SlurmAdapter {
    pub fn new(shell: Shell) -> Self {
        Self { shell }
    }

    /// Extracts the job id: the trailing number of the last line carrying one
    pub fn parse_job_id(output: &str) -> Option<String> {
        output
            .lines()
            .filter_map(trailing_number)
            .last()
            .map(str::to_string)
    }

    /// Maps one `squeue -o %T` line to a job state
    pub fn parse_state(state: &str) -> JobState {
        // "CANCELLED by 1234" is reported for user cancellations
        let state = state.split_whitespace().next().unwrap_or_default();

        if state == "COMPLETED" {
            JobState::Succeeded
        } else if FAILED_STATES.contains(&state) {
            JobState::Failed {
                exit_code: None,
                reason: format!("SLURM reported {}", state),
            }
        } else {
            JobState::Running
        }
    }

    /// `squeue` says nothing about jobs that already left the queue
    async fn left_queue(&self, handle: &JobHandle) -> Result<JobState, PollError> {
        match read_ended_marker(&self.shell).await? {
            Some(state) => Ok(state),
            None => {
                warn!("SLURM job {} left the queue without an end marker", handle.id);
                Ok(JobState::Failed {
                    exit_code: None,
                    reason: "job left the queue without writing job.ended".to_string(),
                })
            }
        }
    }
}

#[async_trait]
impl SchedulerAdapter for SlurmAdapter {
    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, SubmissionError> {
        let command = format!("sbatch --job-name={} {}", quote(&spec.name), spec.script);

        let output = self
            .shell
            .run(&command)
            .await
            .map_err(|source| SubmissionError::Launch {
                command: command.clone(),
                source,
            })?;

        if !output.success() {
            return Err(SubmissionError::Rejected {
                command,
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }

        let job_id = Self::parse_job_id(&output.stdout).ok_or_else(|| {
            SubmissionError::UnparsableJobId {
                output: output.stdout.trim().to_string(),
            }
        })?;

        info!("Submitted SLURM job {}", job_id);
        Ok(JobHandle::new(job_id))
    }

    async fn poll(&self, handle: &JobHandle) -> Result<JobState, PollError> {
        if let Some(state) = read_ended_marker(&self.shell).await? {
            return Ok(state);
        }

        let command = format!("squeue -h -j {} -o %T", handle.id);
        let output = self
            .shell
            .run(&command)
            .await
            .map_err(|source| PollError::Launch {
                command: command.clone(),
                source,
            })?;

        if !output.success() {
            if output.stderr.contains("Invalid job id") {
                return self.left_queue(handle).await;
            }

            return Err(PollError::Query {
                command,
                message: output.stderr.trim().to_string(),
            });
        }

        match output.stdout.lines().map(str::trim).find(|l| !l.is_empty()) {
            Some(state) => {
                debug!("SLURM job {} is {}", handle.id, state);
                Ok(Self::parse_state(state))
            }
            None => self.left_queue(handle).await,
        }
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<(), CancellationError> {
        let command = format!("scancel {}", handle.id);

        let output = self
            .shell
            .run(&command)
            .await
            .map_err(|source| CancellationError::Launch {
                command: command.clone(),
                source,
            })?;

        if output.success() {
            info!("Cancelled SLURM job {}", handle.id);
            return Ok(());
        }

        cancel_failed(self, handle, command, output.stderr.trim().to_string()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::stub_command;
    use crate::work_area::ENDED_MARKER;
    use fanout_core::domain::site::Site;
    use tempfile::TempDir;

    const INVALID_JOB: &str = "echo 'slurm_load_jobs error: Invalid job id specified' >&2; exit 1";
    const ALREADY_DONE: &str = "echo 'scancel: error: Kill job error on job id 4242: \
        Job/step already completing or completed' >&2; exit 1";

    struct Cluster {
        dir: TempDir,
        adapter: SlurmAdapter,
    }

    impl Cluster {
        /// Work area with stand-ins for `sbatch`, `squeue` and `scancel`
        fn new(squeue: &str, scancel: &str) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let bin = dir.path().join("bin");
            stub_command(&bin, "sbatch", "echo \"$@\" > sbatch.args; echo 'Submitted batch job 4242'");
            stub_command(&bin, "squeue", squeue);
            stub_command(&bin, "scancel", scancel);

            let shell = Shell::local(dir.path()).with_bin(bin);
            Self {
                dir,
                adapter: SlurmAdapter::new(shell),
            }
        }

        fn write_marker(&self, content: &str) {
            std::fs::write(self.dir.path().join(ENDED_MARKER), content).unwrap();
        }
    }

    #[tokio::test]
    async fn test_submit_and_poll_through_queue() {
        let cluster = Cluster::new("echo RUNNING", "true");
        let spec = JobSpec::for_site(&Site::direct(0, "hpc"));

        let handle = cluster.adapter.submit(&spec).await.unwrap();
        assert_eq!(handle.id, "4242");
        assert_eq!(
            std::fs::read_to_string(cluster.dir.path().join("sbatch.args")).unwrap(),
            "--job-name=fanout-site_0 run.sh\n"
        );

        assert_eq!(cluster.adapter.poll(&handle).await.unwrap(), JobState::Running);
        assert!(!cluster.adapter.is_terminal(&handle).await.unwrap());

        // the marker wins over the queue state
        cluster.write_marker("0\n");
        assert_eq!(cluster.adapter.poll(&handle).await.unwrap(), JobState::Succeeded);
    }

    #[tokio::test]
    async fn test_rejected_submission() {
        let cluster = Cluster::new("true", "true");
        stub_command(
            &cluster.dir.path().join("bin"),
            "sbatch",
            "echo 'sbatch: error: invalid partition' >&2; exit 1",
        );

        let err = cluster
            .adapter
            .submit(&JobSpec::for_site(&Site::direct(0, "hpc")))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmissionError::Rejected { exit_code: 1, .. }));
    }

    #[tokio::test]
    async fn test_job_left_queue_without_marker_fails() {
        let handle = JobHandle::new("4242");

        let gone = Cluster::new(INVALID_JOB, "true");
        assert!(matches!(
            gone.adapter.poll(&handle).await.unwrap(),
            JobState::Failed { exit_code: None, .. }
        ));

        // an empty listing means the same thing
        let empty = Cluster::new("true", "true");
        assert!(empty.adapter.is_terminal(&handle).await.unwrap());
    }

    #[tokio::test]
    async fn test_unreachable_queue_is_a_poll_error() {
        let cluster = Cluster::new(
            "echo 'slurm_load_jobs error: Unable to contact slurm controller' >&2; exit 1",
            "true",
        );

        let err = cluster.adapter.poll(&JobHandle::new("4242")).await.unwrap_err();
        assert!(matches!(err, PollError::Query { .. }));
    }

    #[tokio::test]
    async fn test_cancel_after_completion_is_noop() {
        let cluster = Cluster::new("echo COMPLETED", ALREADY_DONE);

        cluster.adapter.cancel(&JobHandle::new("4242")).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_failure_on_live_job_is_reported() {
        let cluster = Cluster::new("echo RUNNING", "echo 'scancel: error: Access denied' >&2; exit 1");

        let err = cluster
            .adapter
            .cancel(&JobHandle::new("4242"))
            .await
            .unwrap_err();
        assert!(matches!(err, CancellationError::Rejected { .. }));
    }

    #[test]
    fn test_parse_job_id() {
        assert_eq!(
            SlurmAdapter::parse_job_id("Submitted batch job 123456\n"),
            Some("123456".to_string())
        );
        assert_eq!(
            SlurmAdapter::parse_job_id("sbatch: warning: fair share low\nSubmitted batch job 9\n"),
            Some("9".to_string())
        );
        assert_eq!(SlurmAdapter::parse_job_id("sbatch: error: denied"), None);
        assert_eq!(SlurmAdapter::parse_job_id(""), None);
    }

    #[test]
    fn test_parse_state() {
        assert_eq!(SlurmAdapter::parse_state("PENDING"), JobState::Running);
        assert_eq!(SlurmAdapter::parse_state("RUNNING"), JobState::Running);
        assert_eq!(SlurmAdapter::parse_state("COMPLETING"), JobState::Running);
        assert_eq!(SlurmAdapter::parse_state("COMPLETED"), JobState::Succeeded);
        assert!(SlurmAdapter::parse_state("TIMEOUT").is_terminal());
        assert!(SlurmAdapter::parse_state("CANCELLED by 1000").is_terminal());
        assert!(matches!(
            SlurmAdapter::parse_state("OUT_OF_MEMORY"),
            JobState::Failed { exit_code: None, .. }
        ));
    }
}
