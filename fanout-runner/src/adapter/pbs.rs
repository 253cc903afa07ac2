//! PBS adapter
//!
//! Submission goes through `qsub`, status through `qstat -f`, cancellation
//! through `qdel`. Like SLURM, the `job.ended` marker is consulted first.

use async_trait::async_trait;
use fanout_core::error::{CancellationError, PollError, SubmissionError};
use tracing::{debug, info, warn};

use super::shell::{Shell, quote};
use super::{
    JobHandle, JobSpec, JobState, SchedulerAdapter, cancel_failed, leading_number,
    read_ended_marker,
};

/// Fragments of `qstat` errors for jobs the server no longer tracks
const GONE_MESSAGES: &[&str] = &["Unknown Job Id", "Job has finished", "job has finished"];

pub struct PbsAdapter {
    shell: Shell,
}

impl PbsAdapter {
    pub fn new(shell: Shell) -> Self {
        Self { shell }
    }

    /// Extracts the job id: the leading number of the first line carrying one
    pub fn parse_job_id(output: &str) -> Option<String> {
        output
            .lines()
            .find_map(leading_number)
            .map(str::to_string)
    }

    /// Reads `job_state` and `Exit_status` out of `qstat -f` output
    pub fn parse_qstat(output: &str) -> JobState {
        let mut state = None;
        let mut exit_status = None;

        for line in output.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };

            match key.trim() {
                "job_state" => state = Some(value.trim().to_string()),
                "Exit_status" => exit_status = value.trim().parse::<i32>().ok(),
                _ => {}
            }
        }

        match state.as_deref() {
            // F: finished (PBS Pro), C: completed (Torque)
            Some("F") | Some("C") => match exit_status {
                Some(0) | None => JobState::Succeeded,
                Some(code) => JobState::Failed {
                    exit_code: Some(code),
                    reason: format!("PBS exit status {}", code),
                },
            },
            _ => JobState::Running,
        }
    }

    async fn left_queue(&self, handle: &JobHandle) -> Result<JobState, PollError> {
        match read_ended_marker(&self.shell).await? {
            Some(state) => Ok(state),
            None => {
                warn!("PBS job {} left the queue without an end marker", handle.id);
                Ok(JobState::Failed {
                    exit_code: None,
                    reason: "job left the queue without writing job.ended".to_string(),
                })
            }
        }
    }
}

#[async_trait]
impl SchedulerAdapter for PbsAdapter {
    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, SubmissionError> {
        let command = format!("qsub -N {} {}", quote(&spec.name), spec.script);

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

        info!("Submitted PBS job {}", job_id);
        Ok(JobHandle::new(job_id))
    }

    async fn poll(&self, handle: &JobHandle) -> Result<JobState, PollError> {
        if let Some(state) = read_ended_marker(&self.shell).await? {
            return Ok(state);
        }

        let command = format!("qstat -f {}", handle.id);
        let output = self
            .shell
            .run(&command)
            .await
            .map_err(|source| PollError::Launch {
                command: command.clone(),
                source,
            })?;

        if !output.success() {
            if GONE_MESSAGES.iter().any(|m| output.stderr.contains(m)) {
                return self.left_queue(handle).await;
            }

            return Err(PollError::Query {
                command,
                message: output.stderr.trim().to_string(),
            });
        }

        let state = Self::parse_qstat(&output.stdout);
        debug!("PBS job {} is {:?}", handle.id, state);
        Ok(state)
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<(), CancellationError> {
        let command = format!("qdel {}", handle.id);

        let output = self
            .shell
            .run(&command)
            .await
            .map_err(|source| CancellationError::Launch {
                command: command.clone(),
                source,
            })?;

        if output.success() {
            info!("Cancelled PBS job {}", handle.id);
            return Ok(());
        }

        cancel_failed(self, handle, command, output.stderr.trim().to_string()).await
    }
}
