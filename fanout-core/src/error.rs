//! Error types shared across Fanout
//!
//! Failures are isolated per site: only `ConfigurationError` aborts an
//! execution, and it does so before any site starts. A lost winner claim is
//! not an error at all and has no variant here.

use std::time::Duration;
use thiserror::Error;

use crate::domain::job::JobStatus;
use crate::domain::site::SiteId;

/// Invalid or empty configuration, fatal before dispatch
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("No sites enabled")]
    NoSitesEnabled,

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to prepare {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigurationError {
    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}

/// The scheduler could not take the job, or its answer made no sense
#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("Failed to prepare run script: {0}")]
    Script(#[source] std::io::Error),

    #[error("Failed to launch '{command}': {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' exited with code {exit_code}: {stderr}")]
    Rejected {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Could not parse a job id from '{output}'")]
    UnparsableJobId { output: String },
}

/// A status query failed; callers retry with backoff
#[derive(Debug, Error)]
pub enum PollError {
    #[error("Failed to run status query '{command}': {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Status query '{command}' failed: {message}")]
    Query { command: String, message: String },
}

/// A cancel command failed; logged, never fatal
#[derive(Debug, Error)]
pub enum CancellationError {
    #[error("Failed to run '{command}': {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' failed: {stderr}")]
    Rejected { command: String, stderr: String },

    #[error("Cancellation did not finish within {0:?}")]
    TimedOut(Duration),
}

/// An attempt to move a job backwards or out of a terminal state
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Invalid transition for {site_id}: {from} -> {to}")]
pub struct TransitionError {
    pub site_id: SiteId,
    pub from: JobStatus,
    pub to: JobStatus,
}
