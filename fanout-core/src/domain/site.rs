//! Site domain model
//!
//! A site is one candidate place to run the job: a host reachable directly
//! or through a batch scheduler. Sites are built from configuration at
//! startup and never change afterwards.

use serde::{Deserialize, Serialize};

/// Stable identifier of a site, `site_<index>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(String);

impl SiteId {
    /// Builds the identifier for the site at `index` in the configuration
    pub fn from_index(index: usize) -> Self {
        Self(format!("site_{}", index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SiteId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for SiteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which batch system a site submits through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    /// Run the script detached on the host, no scheduler involved
    Direct,
    Slurm,
    Pbs,
}

impl std::fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerKind::Direct => write!(f, "direct"),
            SchedulerKind::Slurm => write!(f, "slurm"),
            SchedulerKind::Pbs => write!(f, "pbs"),
        }
    }
}

/// Connection descriptor for a site
///
/// With no host every command runs on the local machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(default, alias = "ip")]
    pub host: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
}

impl Resource {
    /// The `user@host` argument handed to ssh, if the site is remote
    pub fn ssh_target(&self) -> Option<String> {
        let host = self.host.as_deref().filter(|h| !h.is_empty())?;
        match self.user.as_deref().filter(|u| !u.is_empty()) {
            Some(user) => Some(format!("{}@{}", user, host)),
            None => Some(host.to_string()),
        }
    }
}

/// SLURM submission parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlurmOptions {
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub partition: Option<String>,
    #[serde(default = "default_walltime")]
    pub time: String,
    #[serde(default = "default_nodes")]
    pub nodes: u32,
    #[serde(default)]
    pub cpus_per_task: Option<u32>,
    /// Extra `#SBATCH` lines, without the prefix
    #[serde(default)]
    pub directives: Vec<String>,
}

impl Default for SlurmOptions {
    fn default() -> Self {
        Self {
            account: None,
            partition: None,
            time: default_walltime(),
            nodes: default_nodes(),
            cpus_per_task: None,
            directives: Vec::new(),
        }
    }
}

/// PBS submission parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PbsOptions {
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default = "default_walltime")]
    pub walltime: String,
    /// Extra `#PBS` lines, without the prefix
    #[serde(default)]
    pub directives: Vec<String>,
}

impl Default for PbsOptions {
    fn default() -> Self {
        Self {
            account: None,
            queue: None,
            walltime: default_walltime(),
            directives: Vec::new(),
        }
    }
}

/// A resolved, enabled-or-not compute site
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub id: SiteId,
    pub index: usize,
    pub name: String,
    pub kind: SchedulerKind,
    pub resource: Resource,
    pub slurm: SlurmOptions,
    pub pbs: PbsOptions,
    pub enabled: bool,
    /// Display ordering only, never consulted for arbitration
    pub priority: i32,
}

impl Site {
    /// Creates an enabled direct site with default scheduler options
    pub fn direct(index: usize, name: impl Into<String>) -> Self {
        Self {
            id: SiteId::from_index(index),
            index,
            name: name.into(),
            kind: SchedulerKind::Direct,
            resource: Resource::default(),
            slurm: SlurmOptions::default(),
            pbs: PbsOptions::default(),
            enabled: true,
            priority: index as i32 + 1,
        }
    }

    /// Label used when tagging output and log lines
    pub fn label(&self) -> String {
        format!("{} ({})", self.id, self.name)
    }
}

fn default_walltime() -> String {
    "04:00:00".to_string()
}

fn default_nodes() -> u32 {
    1
}
