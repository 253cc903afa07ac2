//! Job domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::site::SiteId;
use crate::error::TransitionError;

/// Per-site job record
///
/// Created when a site runner starts, mutated only by that runner and kept
/// after termination for the summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub site_id: SiteId,
    /// Scheduler-assigned identifier, opaque and scheduler dependent
    pub job_id: Option<String>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
}

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Submitting,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// True for COMPLETED, FAILED and CANCELLED
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether `self -> next` is a forward move of the lifecycle
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;

        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Cancelled) => true,
            (Pending, Submitting) => true,
            (Submitting, Running) | (Submitting, Failed) => true,
            (Running, Completed) | (Running, Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Submitting => "SUBMITTING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

impl Job {
    pub fn new(site_id: SiteId) -> Self {
        Self {
            site_id,
            job_id: None,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            submitted_at: None,
            ended_at: None,
            exit_code: None,
            error_message: None,
        }
    }

    /// Moves the job to `next`, refusing anything but a forward move
    ///
    /// Reaching a terminal state stamps `ended_at`.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                site_id: self.site_id.clone(),
                from: self.status,
                to: next,
            });
        }

        self.status = next;
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
        }

        Ok(())
    }

    /// Records the identifier returned by the scheduler
    pub fn record_submission(&mut self, job_id: String) {
        self.job_id = Some(job_id);
        self.submitted_at = Some(Utc::now());
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut job = Job::new(SiteId::from_index(0));
        assert_eq!(job.status, JobStatus::Pending);

        job.transition(JobStatus::Submitting).unwrap();
        job.transition(JobStatus::Running).unwrap();
        assert!(job.ended_at.is_none());

        job.transition(JobStatus::Completed).unwrap();
        assert!(job.is_terminal());
        assert!(job.ended_at.is_some());
    }

    #[test]
    fn test_cancel_reachable_from_any_non_terminal() {
        for status in [
            JobStatus::Pending,
            JobStatus::Submitting,
            JobStatus::Running,
        ] {
            assert!(status.can_transition_to(JobStatus::Cancelled));
        }
    }

    #[test]
    fn test_terminal_states_are_final() {
        let all = [
            JobStatus::Pending,
            JobStatus::Submitting,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ];

        for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            for next in all {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_rejected_transition_leaves_job_untouched() {
        let mut job = Job::new(SiteId::from_index(1));
        job.transition(JobStatus::Cancelled).unwrap();
        let ended_at = job.ended_at;

        let err = job.transition(JobStatus::Running).unwrap_err();
        assert_eq!(err.from, JobStatus::Cancelled);
        assert_eq!(err.to, JobStatus::Running);
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.ended_at, ended_at);
    }

    #[test]
    fn test_no_skipping_submission() {
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Submitting.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Submitting));
    }

    #[test]
    fn test_status_serializes_uppercase() {
        let json = serde_json::to_string(&JobStatus::Cancelled).unwrap();
        assert_eq!(json, "\"CANCELLED\"");
        assert_eq!(JobStatus::Submitting.to_string(), "SUBMITTING");
    }
}
