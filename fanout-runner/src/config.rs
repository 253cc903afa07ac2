//! Execution configuration
//!
//! A JSON file describes the sites and the script; a few environment
//! variables and command line flags may override the global knobs.
//! All durations are given in seconds.

use anyhow::{Context, Result};
use fanout_core::domain::execution::ExecutionMode;
use fanout_core::domain::site::{PbsOptions, Resource, SchedulerKind, Site, SlurmOptions};
use fanout_core::error::ConfigurationError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::coordinator::ExecutionPlan;
use crate::runner::RunnerSettings;
use crate::script::{ScriptBuilder, ScriptSource};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Delay between two status queries of the same site
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,

    #[serde(default)]
    pub execution_mode: ExecutionMode,

    /// Directory that receives the coordination root
    #[serde(default = "default_rundir")]
    pub rundir: PathBuf,

    /// Inline script body
    #[serde(default)]
    pub script: Option<String>,

    /// Script file used when `use_existing_script` is set
    #[serde(default)]
    pub script_path: Option<PathBuf>,

    #[serde(default)]
    pub use_existing_script: bool,

    /// Keep a `run.sh` already present in a work area
    #[serde(default)]
    pub reuse_script: bool,

    #[serde(default = "default_true")]
    pub inject_markers: bool,

    #[serde(default = "default_max_poll_retries")]
    pub max_poll_retries: u32,

    #[serde(default = "default_poll_backoff_max")]
    pub poll_backoff_max: u64,

    #[serde(default = "default_cancel_timeout")]
    pub cancel_timeout: u64,

    /// Fail sites still running after this long
    #[serde(default)]
    pub max_runtime: Option<u64>,

    /// How often site output is collected
    #[serde(default = "default_output_interval")]
    pub output_interval: u64,

    #[serde(default)]
    pub sites: Vec<SiteConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub resource: Resource,

    /// Display order; defaults to the position in the list
    #[serde(default)]
    pub priority: Option<i32>,

    /// Submit through a batch scheduler instead of running directly
    #[serde(default)]
    pub scheduler: bool,

    #[serde(default, alias = "schedulerType")]
    pub scheduler_type: Option<String>,

    #[serde(default)]
    pub slurm: SlurmOptions,

    #[serde(default)]
    pub pbs: PbsOptions,
}

fn default_poll_interval() -> u64 {
    10
}

fn default_rundir() -> PathBuf {
    PathBuf::from(".")
}

fn default_true() -> bool {
    true
}

fn default_max_poll_retries() -> u32 {
    5
}

fn default_poll_backoff_max() -> u64 {
    60
}

fn default_cancel_timeout() -> u64 {
    30
}

fn default_output_interval() -> u64 {
    2
}

impl Config {
    /// Reads and parses a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;

        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;

        debug!(
            "Loaded {} site(s) from {}",
            config.sites.len(),
            path.display()
        );
        Ok(config)
    }

    /// Applies environment overrides
    ///
    /// Recognized variables:
    /// - FANOUT_POLL_INTERVAL (seconds)
    /// - FANOUT_EXECUTION_MODE (race or parallel)
    /// - FANOUT_RUNDIR
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("FANOUT_POLL_INTERVAL") {
            match value.parse::<u64>() {
                Ok(secs) => self.poll_interval = secs,
                Err(_) => warn!("Ignoring invalid FANOUT_POLL_INTERVAL '{}'", value),
            }
        }

        if let Some(value) = lookup("FANOUT_EXECUTION_MODE") {
            match value.parse::<ExecutionMode>() {
                Ok(mode) => self.execution_mode = mode,
                Err(e) => warn!("Ignoring FANOUT_EXECUTION_MODE: {}", e),
            }
        }

        if let Some(value) = lookup("FANOUT_RUNDIR") {
            self.rundir = PathBuf::from(value);
        }
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.poll_interval == 0 {
            return Err(invalid("poll_interval must be greater than 0"));
        }

        if self.output_interval == 0 {
            return Err(invalid("output_interval must be greater than 0"));
        }

        if self.cancel_timeout == 0 {
            return Err(invalid("cancel_timeout must be greater than 0"));
        }

        if self.max_runtime == Some(0) {
            return Err(invalid("max_runtime must be greater than 0"));
        }

        if self.use_existing_script {
            if self.script_path.is_none() {
                return Err(invalid("use_existing_script requires script_path"));
            }
        } else if self.script.is_none() {
            return Err(invalid("no script given"));
        }

        for (index, site) in self.sites.iter().enumerate() {
            if site.enabled {
                site.kind(index)?;
            }
        }

        Ok(())
    }

    /// Resolves every configured site, disabled ones included
    pub fn sites(&self) -> Result<Vec<Site>, ConfigurationError> {
        self.sites
            .iter()
            .enumerate()
            .map(|(index, site)| site.resolve(index))
            .collect()
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            poll_interval: Duration::from_secs(self.poll_interval),
            max_poll_retries: self.max_poll_retries,
            poll_backoff_max: Duration::from_secs(self.poll_backoff_max),
            cancel_timeout: Duration::from_secs(self.cancel_timeout),
            max_runtime: self.max_runtime.map(Duration::from_secs),
        }
    }

    pub fn script_builder(&self) -> Result<ScriptBuilder, ConfigurationError> {
        let source = match (&self.script, &self.script_path) {
            (_, Some(path)) if self.use_existing_script => ScriptSource::Existing(path.clone()),
            (Some(body), _) => ScriptSource::Inline(body.clone()),
            _ => return Err(invalid("no script given")),
        };

        Ok(ScriptBuilder::new(source)
            .inject_markers(self.inject_markers)
            .reuse_existing(self.reuse_script))
    }

    /// Validates and turns the configuration into an execution plan
    pub fn into_plan(self, execution_id: String) -> Result<ExecutionPlan, ConfigurationError> {
        self.validate()?;

        Ok(ExecutionPlan {
            execution_id,
            mode: self.execution_mode,
            sites: self.sites()?,
            script: self.script_builder()?,
            settings: self.runner_settings(),
            output_interval: Duration::from_secs(self.output_interval),
            rundir: self.rundir,
        })
    }
}

impl SiteConfig {
    fn display_name(&self, index: usize) -> String {
        self.name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| format!("Site-{}", index))
    }

    fn kind(&self, index: usize) -> Result<SchedulerKind, ConfigurationError> {
        if !self.scheduler {
            return Ok(SchedulerKind::Direct);
        }

        match self
            .scheduler_type
            .as_deref()
            .map(|t| t.trim().to_ascii_lowercase())
            .as_deref()
        {
            Some("slurm") => Ok(SchedulerKind::Slurm),
            Some("pbs") => Ok(SchedulerKind::Pbs),
            _ => Err(ConfigurationError::Invalid(format!(
                "{}: Scheduler enabled but no scheduler type is active",
                self.display_name(index)
            ))),
        }
    }

    fn resolve(&self, index: usize) -> Result<Site, ConfigurationError> {
        let mut site = Site::direct(index, self.display_name(index));

        site.kind = match self.kind(index) {
            Ok(kind) => kind,
            // never dispatched, so its scheduler settings are irrelevant
            Err(_) if !self.enabled => SchedulerKind::Direct,
            Err(e) => return Err(e),
        };
        site.resource = self.resource.clone();
        site.slurm = self.slurm.clone();
        site.pbs = self.pbs.clone();
        site.enabled = self.enabled;
        if let Some(priority) = self.priority {
            site.priority = priority;
        }

        Ok(site)
    }
}

fn invalid(message: &str) -> ConfigurationError {
    ConfigurationError::Invalid(message.to_string())
}
