//! Site runner
//!
//! Owns one site's job from submission to a terminal state. Each runner is
//! its own task and only meets its siblings through the winner arbiter and
//! the event log.

use fanout_core::domain::job::{Job, JobStatus};
use fanout_core::domain::site::{Site, SiteId};
use fanout_core::error::{CancellationError, SubmissionError};
use std::future::pending;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::adapter::{JobHandle, JobSpec, JobState, SchedulerAdapter};
use crate::arbiter::{Claim, WinnerArbiter};
use crate::script::ScriptBuilder;
use crate::service::event_log::EventSink;
use crate::work_area::WorkArea;

/// Exit code recorded for jobs stopped by `max_runtime`
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Timing knobs shared by every runner of an execution
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub poll_interval: Duration,
    /// Consecutive failed status queries tolerated before giving up
    pub max_poll_retries: u32,
    pub poll_backoff_max: Duration,
    pub cancel_timeout: Duration,
    pub max_runtime: Option<Duration>,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            max_poll_retries: 5,
            poll_backoff_max: Duration::from_secs(60),
            cancel_timeout: Duration::from_secs(30),
            max_runtime: None,
        }
    }
}

impl RunnerSettings {
    /// Delay before the next poll after `failures` consecutive errors
    fn backoff(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.min(16));
        self.poll_interval
            .saturating_mul(factor)
            .min(self.poll_backoff_max.max(self.poll_interval))
    }
}

/// What woke the monitor loop
enum Wake {
    Tick,
    Winner(SiteId),
    Shutdown,
    Deadline,
}

pub struct SiteRunner {
    site: Site,
    adapter: Arc<dyn SchedulerAdapter>,
    area: WorkArea,
    script: Arc<ScriptBuilder>,
    events: Arc<dyn EventSink>,
    arbiter: Option<Arc<WinnerArbiter>>,
    settings: RunnerSettings,
    shutdown: watch::Receiver<bool>,
    job: Job,
    handle: Option<JobHandle>,
    /// A submitted job the scheduler has not reported finished yet
    outstanding: bool,
    cleaned: bool,
}

impl SiteRunner {
    pub fn new(
        site: Site,
        adapter: Arc<dyn SchedulerAdapter>,
        area: WorkArea,
        script: Arc<ScriptBuilder>,
        events: Arc<dyn EventSink>,
        settings: RunnerSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let job = Job::new(site.id.clone());

        Self {
            site,
            adapter,
            area,
            script,
            events,
            arbiter: None,
            settings,
            shutdown,
            job,
            handle: None,
            outstanding: false,
            cleaned: false,
        }
    }

    /// Enters the race: a local success must claim `arbiter` to count
    pub fn racing(mut self, arbiter: Arc<WinnerArbiter>) -> Self {
        self.arbiter = Some(arbiter);
        self
    }

    /// Drives the job to a terminal state and returns its record
    pub async fn run(mut self) -> Job {
        info!("Starting {}", self.site.label());

        if let Some(reason) = self.skip_reason() {
            info!("Not submitting {}: {}", self.site.id, reason);
            self.advance(JobStatus::Cancelled, Some(reason));
        } else {
            match self.submit().await {
                Ok(()) => self.monitor().await,
                Err(e) => {
                    error!("Submission failed for {}: {}", self.site.label(), e);
                    self.fail(None, e.to_string());
                }
            }
        }

        self.cleanup().await;

        info!("{} finished as {}", self.site.label(), self.job.status);
        self.job
    }

    fn skip_reason(&self) -> Option<String> {
        if *self.shutdown.borrow() {
            return Some("execution interrupted".to_string());
        }

        match self.arbiter.as_ref().and_then(|a| a.winner()) {
            Some(winner) if *winner != self.site.id => {
                Some(format!("{} already won the race", winner))
            }
            _ => None,
        }
    }

    /// Writes the run script, submits it and records the job id
    async fn submit(&mut self) -> Result<(), SubmissionError> {
        self.advance(JobStatus::Submitting, None);

        self.script
            .prepare(&self.site, &self.area)
            .await
            .map_err(SubmissionError::Script)?;

        let handle = self.adapter.submit(&JobSpec::for_site(&self.site)).await?;

        if let Err(e) = self.area.write_job_id(&handle.id).await {
            warn!("Failed to record job id for {}: {}", self.site.id, e);
        }

        self.job.record_submission(handle.id.clone());
        self.outstanding = true;
        self.advance(JobStatus::Running, Some(format!("job {}", handle.id)));
        self.handle = Some(handle);

        Ok(())
    }

    /// Polls until the job ends, another site wins, or the execution stops
    async fn monitor(&mut self) {
        let Some(handle) = self.handle.clone() else {
            return;
        };

        let mut winner_rx = self.arbiter.as_ref().map(|a| a.subscribe());
        let deadline = self.settings.max_runtime.map(|d| Instant::now() + d);
        let mut delay = self.settings.poll_interval;
        let mut failures = 0u32;

        loop {
            let wake = tokio::select! {
                winner = wait_foreign_winner(winner_rx.as_mut(), &self.site.id) => Wake::Winner(winner),
                _ = wait_shutdown(&mut self.shutdown) => Wake::Shutdown,
                _ = wait_deadline(deadline) => Wake::Deadline,
                _ = time::sleep(delay) => Wake::Tick,
            };

            if !matches!(wake, Wake::Tick) && self.settle(&handle).await {
                return;
            }

            match wake {
                Wake::Winner(winner) => {
                    self.cancel_job().await;
                    self.advance(
                        JobStatus::Cancelled,
                        Some(format!("{} won the race", winner)),
                    );
                    return;
                }
                Wake::Shutdown => {
                    self.cancel_job().await;
                    self.advance(JobStatus::Cancelled, Some("execution interrupted".to_string()));
                    return;
                }
                Wake::Deadline => {
                    self.cancel_job().await;
                    let limit = self.settings.max_runtime.unwrap_or_default();
                    self.fail(
                        Some(TIMEOUT_EXIT_CODE),
                        format!("exceeded max runtime of {:?}", limit),
                    );
                    return;
                }
                Wake::Tick => {}
            }

            match self.adapter.poll(&handle).await {
                Ok(JobState::Running) => {
                    debug!("{} job {} still running", self.site.id, handle.id);
                    failures = 0;
                    delay = self.settings.poll_interval;
                }
                Ok(state) => {
                    self.finish(state);
                    return;
                }
                Err(e) => {
                    failures += 1;

                    if failures > self.settings.max_poll_retries {
                        error!(
                            "Giving up on {} after {} failed status queries: {}",
                            self.site.id, failures, e
                        );
                        self.cancel_job().await;
                        self.fail(None, format!("status query kept failing: {}", e));
                        return;
                    }

                    delay = self.settings.backoff(failures);
                    warn!(
                        "Status query for {} failed (attempt {}/{}): {}",
                        self.site.id, failures, self.settings.max_poll_retries, e
                    );
                    warn!("Retrying in {:?}...", delay);
                }
            }
        }
    }

    /// Last status query before the runner stops the job itself
    ///
    /// A job that already ended keeps its own outcome, so a local failure
    /// stays FAILED whatever else happened. Returns whether it had ended.
    async fn settle(&mut self, handle: &JobHandle) -> bool {
        let polled = time::timeout(self.settings.cancel_timeout, self.adapter.poll(handle)).await;

        match polled {
            Ok(Ok(JobState::Running)) => false,
            Ok(Ok(state)) => {
                debug!("{} job {} had already ended", self.site.id, handle.id);
                self.finish(state);
                true
            }
            Ok(Err(e)) => {
                debug!("Final status query for {} failed: {}", self.site.id, e);
                false
            }
            Err(_) => {
                debug!("Final status query for {} timed out", self.site.id);
                false
            }
        }
    }

    /// Records the outcome of a job the scheduler reports as ended
    fn finish(&mut self, state: JobState) {
        self.outstanding = false;

        match state {
            JobState::Succeeded => self.succeed(),
            JobState::Failed { exit_code, reason } => self.fail(exit_code, reason),
            JobState::Running => {}
        }
    }

    /// Bounded, idempotent teardown
    ///
    /// Cancels a job still known to be outstanding, moves a non-terminal
    /// record to CANCELLED and leaves a `job.ended` marker behind.
    pub async fn cleanup(&mut self) {
        if self.cleaned {
            debug!("{} already cleaned up", self.site.id);
            return;
        }
        self.cleaned = true;

        self.cancel_job().await;

        if !self.job.is_terminal() {
            self.advance(
                JobStatus::Cancelled,
                Some("stopped before reaching a terminal state".to_string()),
            );
        }

        let content = match self.job.exit_code {
            Some(code) => code.to_string(),
            None => self.job.status.to_string().to_lowercase(),
        };

        match self.area.mark_ended(&content).await {
            Ok(true) => debug!("Marked {} ended", self.site.id),
            Ok(false) => {}
            Err(e) => warn!("Failed to write end marker for {}: {}", self.site.id, e),
        }
    }

    fn succeed(&mut self) {
        self.job.exit_code = Some(0);

        let Some(arbiter) = self.arbiter.clone() else {
            self.advance(JobStatus::Completed, None);
            return;
        };

        match arbiter.claim(&self.site.id) {
            Claim::Won => self.advance(JobStatus::Completed, Some("won the race".to_string())),
            Claim::Lost(winner) => {
                info!("{} finished but {} already won", self.site.id, winner);
                self.advance(
                    JobStatus::Cancelled,
                    Some(format!("finished after {} won the race", winner)),
                );
            }
        }
    }

    fn fail(&mut self, exit_code: Option<i32>, reason: String) {
        self.job.exit_code = exit_code;
        self.job.error_message = Some(reason.clone());
        self.advance(JobStatus::Failed, Some(reason));
    }

    /// Best-effort cancel, bounded by `cancel_timeout`
    async fn cancel_job(&mut self) {
        if !self.outstanding {
            return;
        }
        self.outstanding = false;

        let Some(handle) = &self.handle else {
            return;
        };

        let result = time::timeout(self.settings.cancel_timeout, self.adapter.cancel(handle))
            .await
            .unwrap_or(Err(CancellationError::TimedOut(self.settings.cancel_timeout)));

        match result {
            Ok(()) => info!("Cancelled job {} on {}", handle.id, self.site.id),
            Err(e) => warn!("Failed to cancel job {} on {}: {}", handle.id, self.site.id, e),
        }
    }

    /// Applies a transition and appends the matching event
    fn advance(&mut self, next: JobStatus, message: Option<String>) {
        if let Err(e) = self.job.transition(next) {
            warn!("{}", e);
            return;
        }

        debug!("{} -> {}", self.site.id, next);

        match message {
            Some(message) => self.events.status_with(&self.site.id, next, message),
            None => self.events.status(&self.site.id, next),
        }
    }
}

/// Resolves once a site other than `me` holds the winner slot
async fn wait_foreign_winner(
    rx: Option<&mut watch::Receiver<Option<SiteId>>>,
    me: &SiteId,
) -> SiteId {
    let Some(rx) = rx else {
        return pending().await;
    };

    let winner = match rx
        .wait_for(|winner| matches!(winner, Some(id) if id != me))
        .await
    {
        Ok(winner) => winner.clone(),
        Err(_) => None,
    };

    match winner {
        Some(winner) => winner,
        None => pending().await,
    }
}

async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    let raised = rx.wait_for(|stop| *stop).await.is_ok();
    if !raised {
        pending::<()>().await;
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => pending().await,
    }
}
