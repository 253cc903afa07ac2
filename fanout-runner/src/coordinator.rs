//! Execution coordinator
//!
//! Prepares the coordination root, starts one runner task per enabled site
//! and hands the final statuses to the summary reporter.

use fanout_core::domain::execution::{ExecutionMode, Summary};
use fanout_core::domain::site::Site;
use fanout_core::error::ConfigurationError;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Duration;
use tracing::{error, info, warn};

use crate::adapter::{AdapterFactory, SchedulerAdapters};
use crate::arbiter::WinnerArbiter;
use crate::runner::{RunnerSettings, SiteRunner};
use crate::script::ScriptBuilder;
use crate::service::{EventLog, EventSink, OutputAggregator, OutputSink, SummaryReporter};
use crate::work_area::CoordinationRoot;

/// Everything needed to run one execution
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub execution_id: String,
    pub mode: ExecutionMode,
    /// Parent of the coordination root
    pub rundir: PathBuf,
    /// Configured sites, disabled ones included
    pub sites: Vec<Site>,
    pub script: ScriptBuilder,
    pub settings: RunnerSettings,
    pub output_interval: Duration,
}

/// An initialized execution, ready to run
#[derive(Debug)]
pub struct Execution {
    root: CoordinationRoot,
    sites: Vec<Site>,
}

impl Execution {
    pub fn root(&self) -> &CoordinationRoot {
        &self.root
    }

    /// Enabled sites, in configuration order
    pub fn sites(&self) -> &[Site] {
        &self.sites
    }
}

pub struct Coordinator {
    plan: ExecutionPlan,
    adapters: Arc<dyn AdapterFactory>,
}

impl Coordinator {
    pub fn new(plan: ExecutionPlan) -> Self {
        Self {
            plan,
            adapters: Arc::new(SchedulerAdapters),
        }
    }

    #[cfg(test)]
    pub fn with_adapters(mut self, adapters: Arc<dyn AdapterFactory>) -> Self {
        self.adapters = adapters;
        self
    }

    /// Creates the coordination state and one work area per enabled site
    ///
    /// Safe to repeat for the same execution id: the event log is emptied,
    /// the winner and summary records are removed and every work area is
    /// cleared of markers from the previous attempt.
    pub fn initialize(&self) -> Result<Execution, ConfigurationError> {
        let sites: Vec<Site> = self
            .plan
            .sites
            .iter()
            .filter(|site| site.enabled)
            .cloned()
            .collect();

        if sites.is_empty() {
            return Err(ConfigurationError::NoSitesEnabled);
        }

        let root = CoordinationRoot::new(&self.plan.rundir, &self.plan.execution_id);

        std::fs::create_dir_all(root.path())
            .map_err(|e| ConfigurationError::io(root.path(), e))?;

        let events = root.events_path();
        std::fs::File::create(&events).map_err(|e| ConfigurationError::io(&events, e))?;

        for stale in [root.winner_path(), root.summary_path()] {
            remove_if_present(&stale)?;
        }

        for site in &sites {
            let area = root.work_area(site);
            area.prepare()
                .map_err(|e| ConfigurationError::io(area.path(), e))?;
        }

        info!(
            "Initialized execution {} ({} mode, {} site(s)) in {}",
            self.plan.execution_id,
            self.plan.mode,
            sites.len(),
            root.path().display()
        );

        Ok(Execution { root, sites })
    }

    /// Runs every site to a terminal state and reports the outcome
    ///
    /// Raising `shutdown` cancels every site still running; the summary is
    /// produced either way.
    pub async fn run<S: OutputSink>(
        &self,
        execution: Execution,
        shutdown: watch::Receiver<bool>,
        sink: S,
    ) -> Summary {
        let Execution { root, sites } = execution;

        let (log, writer) = EventLog::spawn(Some(root.events_path()));
        let events: Arc<dyn EventSink> = Arc::new(log);

        let arbiter = match self.plan.mode {
            ExecutionMode::Race => Some(Arc::new(WinnerArbiter::new(Some(root.winner_path())))),
            ExecutionMode::Parallel => None,
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let reporter = SummaryReporter::new(Some(root.summary_path()), stop_tx);

        let mut aggregator = OutputAggregator::new(self.plan.output_interval);
        for site in &sites {
            aggregator.follow(site, &root.work_area(site));
        }
        let output = tokio::spawn(aggregator.run(stop_rx, sink));

        let script = Arc::new(self.plan.script.clone());
        let mut runners = JoinSet::new();

        for site in &sites {
            let area = root.work_area(site);
            let adapter = self.adapters.adapter_for(site, &area);

            let mut runner = SiteRunner::new(
                site.clone(),
                adapter,
                area,
                Arc::clone(&script),
                Arc::clone(&events),
                self.plan.settings.clone(),
                shutdown.clone(),
            );
            if let Some(arbiter) = &arbiter {
                runner = runner.racing(Arc::clone(arbiter));
            }

            runners.spawn(runner.run());
        }

        info!("Started {} site runner(s)", sites.len());

        let mut jobs = HashMap::new();
        while let Some(result) = runners.join_next().await {
            match result {
                Ok(job) => {
                    jobs.insert(job.site_id.clone(), job);
                }
                Err(e) => error!("Site runner task failed: {}", e),
            }
        }

        // the writer drains once the last handle is gone
        drop(events);
        writer.finish().await;

        let winner = arbiter.as_ref().and_then(|a| a.winner().cloned());
        let summary = reporter.report(
            &self.plan.execution_id,
            self.plan.mode,
            winner,
            &sites,
            &jobs,
        );

        if let Err(e) = output.await {
            warn!("Output aggregator failed: {}", e);
        }

        summary
    }
}

fn remove_if_present(path: &Path) -> Result<(), ConfigurationError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ConfigurationError::io(path, e)),
    }
}
