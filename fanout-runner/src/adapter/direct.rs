//! Direct execution
//!
//! The run script is started detached on the host, in its own session when
//! `setsid` is available so the whole process group can be cancelled. The
//! wrapper records the exit code in `job.ended`, which is the only terminal
//! condition for this adapter.

use async_trait::async_trait;
use fanout_core::error::{CancellationError, PollError, SubmissionError};
use tracing::{debug, info};

use super::shell::{Shell, quote};
use super::{JobHandle, JobSpec, JobState, SchedulerAdapter, cancel_failed, read_ended_marker};
use crate::work_area::{OUTPUT_FILE, record_exit_status};

pub struct DirectAdapter {
    shell: Shell,
}

impl DirectAdapter {
    pub fn new(shell: Shell) -> Self {
        Self { shell }
    }

    fn launch_command(spec: &JobSpec) -> String {
        let inner = quote(&format!(
            "./{} > {} 2>&1; {}",
            spec.script,
            OUTPUT_FILE,
            record_exit_status(".")
        ));

        format!(
            "if command -v setsid > /dev/null 2>&1; then \
             setsid sh -c {0} < /dev/null > /dev/null 2>&1 & \
             else sh -c {0} < /dev/null > /dev/null 2>&1 & fi; echo $!",
            inner
        )
    }
}

#[async_trait]
impl SchedulerAdapter for DirectAdapter {
    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, SubmissionError> {
        let command = Self::launch_command(spec);

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

        let pid = output
            .stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .filter(|line| line.bytes().all(|b| b.is_ascii_digit()))
            .ok_or_else(|| SubmissionError::UnparsableJobId {
                output: output.stdout.trim().to_string(),
            })?;

        info!("Started {} as process {}", spec.name, pid);
        Ok(JobHandle::new(pid))
    }

    async fn poll(&self, _handle: &JobHandle) -> Result<JobState, PollError> {
        Ok(read_ended_marker(&self.shell)
            .await?
            .unwrap_or(JobState::Running))
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<(), CancellationError> {
        let command = format!(
            "kill -TERM -- -{0} 2> /dev/null || kill -TERM {0}",
            handle.id
        );

        let output = self
            .shell
            .run(&command)
            .await
            .map_err(|source| CancellationError::Launch {
                command: command.clone(),
                source,
            })?;

        if output.success() {
            debug!("Sent SIGTERM to process {}", handle.id);
            return Ok(());
        }

        cancel_failed(self, handle, command, output.stderr.trim().to_string()).await
    }
}
