//! In-memory adapter for deterministic tests
//!
//! Each adapter follows a fixed plan: how submission behaves, how many
//! polls the job stays running, how it ends and how many polls fail first.

use async_trait::async_trait;
use fanout_core::error::{CancellationError, PollError, SubmissionError};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{JobHandle, JobSpec, JobState, SchedulerAdapter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeed,
    Fail(i32),
    /// Stays running until cancelled
    Never,
}

#[derive(Debug, Default)]
struct State {
    polls: u32,
    poll_errors_left: u32,
    cancelled: bool,
}

pub struct MemoryAdapter {
    accept_submission: bool,
    polls_until_done: u32,
    outcome: Outcome,
    state: Mutex<State>,
    submits: AtomicUsize,
    cancels: AtomicUsize,
}

impl MemoryAdapter {
    fn new(polls_until_done: u32, outcome: Outcome) -> Self {
        Self {
            accept_submission: true,
            polls_until_done,
            outcome,
            state: Mutex::new(State::default()),
            submits: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
        }
    }

    pub fn succeeding_after(polls: u32) -> Self {
        Self::new(polls, Outcome::Succeed)
    }

    pub fn failing_after(polls: u32, exit_code: i32) -> Self {
        Self::new(polls, Outcome::Fail(exit_code))
    }

    pub fn never_finishing() -> Self {
        Self::new(u32::MAX, Outcome::Never)
    }

    pub fn rejecting_submission() -> Self {
        Self {
            accept_submission: false,
            ..Self::never_finishing()
        }
    }

    /// Makes the first `count` polls fail with a `PollError`
    pub fn with_poll_errors(self, count: u32) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.poll_errors_left = count;
        }
        self
    }

    pub fn submit_count(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    /// Cancellations that actually stopped a running job
    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    fn finished_state(&self, state: &State) -> Option<JobState> {
        if state.cancelled {
            return Some(JobState::Failed {
                exit_code: None,
                reason: "cancelled".to_string(),
            });
        }

        if state.polls < self.polls_until_done {
            return None;
        }

        match self.outcome {
            Outcome::Succeed => Some(JobState::Succeeded),
            Outcome::Fail(code) => Some(JobState::Failed {
                exit_code: Some(code),
                reason: format!("exited with code {}", code),
            }),
            Outcome::Never => None,
        }
    }
}

#[async_trait]
impl SchedulerAdapter for MemoryAdapter {
    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, SubmissionError> {
        self.submits.fetch_add(1, Ordering::SeqCst);

        if !self.accept_submission {
            return Err(SubmissionError::Rejected {
                command: format!("memory-submit {}", spec.script),
                exit_code: 1,
                stderr: "submission rejected".to_string(),
            });
        }

        Ok(JobHandle::new(format!("mem-{}", spec.name)))
    }

    async fn poll(&self, _handle: &JobHandle) -> Result<JobState, PollError> {
        let mut state = self.state.lock().map_err(|_| PollError::Query {
            command: "memory-poll".to_string(),
            message: "state poisoned".to_string(),
        })?;

        if state.poll_errors_left > 0 {
            state.poll_errors_left -= 1;
            return Err(PollError::Query {
                command: "memory-poll".to_string(),
                message: "scheduler unreachable".to_string(),
            });
        }

        state.polls = state.polls.saturating_add(1);
        Ok(self.finished_state(&state).unwrap_or(JobState::Running))
    }

    async fn cancel(&self, _handle: &JobHandle) -> Result<(), CancellationError> {
        let mut state = self.state.lock().map_err(|_| CancellationError::Rejected {
            command: "memory-cancel".to_string(),
            stderr: "state poisoned".to_string(),
        })?;

        if self.finished_state(&state).is_none() {
            state.cancelled = true;
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }

        Ok(())
    }
}
