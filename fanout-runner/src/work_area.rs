//! Coordination directory layout
//!
//! One execution owns a coordination root holding:
//! - `events.jsonl`: the shared, append-only event log
//! - `WINNER`: the id of the race winner, written once
//! - `summary.json`: the final summary
//! - `site_<i>/`: one isolated work area per enabled site
//!
//! Each work area holds the run script, the captured output and the
//! lifecycle markers written by the script itself.

use fanout_core::domain::site::Site;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

pub const EVENTS_FILE: &str = "events.jsonl";
pub const WINNER_FILE: &str = "WINNER";
pub const SUMMARY_FILE: &str = "summary.json";

pub const RUN_SCRIPT: &str = "run.sh";
pub const USER_SCRIPT: &str = "run-script.sh";
pub const OUTPUT_FILE: &str = "run.out";
pub const STARTED_MARKER: &str = "job.started";
pub const ENDED_MARKER: &str = "job.ended";
const ENDED_MARKER_TMP: &str = "job.ended.tmp";
pub const HOSTNAME_FILE: &str = "HOSTNAME";
pub const JOB_ID_FILE: &str = "jobid";

/// Files a previous attempt with the same execution id may have left behind
const STALE_SITE_FILES: [&str; 6] = [
    OUTPUT_FILE,
    STARTED_MARKER,
    ENDED_MARKER,
    ENDED_MARKER_TMP,
    HOSTNAME_FILE,
    JOB_ID_FILE,
];

/// Shell command storing `$?` as the `job.ended` marker under `dir`
///
/// The value is renamed into place so a reader never sees a truncated
/// marker.
pub fn record_exit_status(dir: &str) -> String {
    format!(
        "echo $? > {dir}/{tmp} && mv -f {dir}/{tmp} {dir}/{ended}",
        dir = dir,
        tmp = ENDED_MARKER_TMP,
        ended = ENDED_MARKER
    )
}

/// Root directory shared by every site of one execution
#[derive(Debug, Clone)]
pub struct CoordinationRoot {
    path: PathBuf,
}

impl CoordinationRoot {
    /// `<rundir>/lb_<execution_id>`
    pub fn new(rundir: &Path, execution_id: &str) -> Self {
        Self {
            path: rundir.join(format!("lb_{}", execution_id)),
        }
    }

    pub fn from_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn events_path(&self) -> PathBuf {
        self.path.join(EVENTS_FILE)
    }

    pub fn winner_path(&self) -> PathBuf {
        self.path.join(WINNER_FILE)
    }

    pub fn summary_path(&self) -> PathBuf {
        self.path.join(SUMMARY_FILE)
    }

    pub fn work_area(&self, site: &Site) -> WorkArea {
        WorkArea {
            path: self.path.join(site.id.as_str()),
        }
    }
}

/// A single site's private directory
#[derive(Debug, Clone)]
pub struct WorkArea {
    path: PathBuf,
}

impl WorkArea {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn run_script(&self) -> PathBuf {
        self.path.join(RUN_SCRIPT)
    }

    pub fn user_script(&self) -> PathBuf {
        self.path.join(USER_SCRIPT)
    }

    pub fn output(&self) -> PathBuf {
        self.path.join(OUTPUT_FILE)
    }

    pub fn ended_marker(&self) -> PathBuf {
        self.path.join(ENDED_MARKER)
    }

    /// Creates the directory and clears markers from an earlier attempt
    pub fn prepare(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.path)?;

        for name in STALE_SITE_FILES {
            match std::fs::remove_file(self.path.join(name)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Stores the scheduler job id next to the script
    pub async fn write_job_id(&self, job_id: &str) -> std::io::Result<()> {
        tokio::fs::write(self.path.join(JOB_ID_FILE), format!("{}\n", job_id)).await
    }

    /// Writes `job.ended` unless the job already wrote it
    ///
    /// Returns whether this call created the marker.
    pub async fn mark_ended(&self, content: &str) -> std::io::Result<bool> {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.ended_marker())
            .await;

        match file {
            Ok(mut file) => {
                file.write_all(format!("{}\n", content).as_bytes()).await?;
                file.flush().await?;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let root = CoordinationRoot::new(Path::new("/scratch"), "abc");
        let site = Site::direct(3, "Site-3");
        let area = root.work_area(&site);

        assert_eq!(root.path(), Path::new("/scratch/lb_abc"));
        assert_eq!(root.events_path(), Path::new("/scratch/lb_abc/events.jsonl"));
        assert_eq!(area.path(), Path::new("/scratch/lb_abc/site_3"));
        assert_eq!(area.run_script(), Path::new("/scratch/lb_abc/site_3/run.sh"));
    }

    #[test]
    fn test_prepare_clears_stale_markers() {
        let dir = tempfile::tempdir().unwrap();
        let root = CoordinationRoot::new(dir.path(), "x");
        let area = root.work_area(&Site::direct(0, "a"));

        area.prepare().unwrap();
        std::fs::write(area.ended_marker(), "0\n").unwrap();
        std::fs::write(area.run_script(), "#!/bin/bash\n").unwrap();

        area.prepare().unwrap();
        assert!(!area.ended_marker().exists());
        assert!(area.run_script().exists());
    }

    #[tokio::test]
    async fn test_record_exit_status_leaves_only_the_marker() {
        let dir = tempfile::tempdir().unwrap();
        let shell = crate::adapter::shell::Shell::local(dir.path());

        let output = shell
            .run(&format!("sh -c 'exit 4'; {}", record_exit_status(".")))
            .await
            .unwrap();

        assert!(output.success());
        assert_eq!(
            std::fs::read_to_string(dir.path().join(ENDED_MARKER)).unwrap(),
            "4\n"
        );
        assert!(!dir.path().join(ENDED_MARKER_TMP).exists());
    }

    #[tokio::test]
    async fn test_mark_ended_keeps_existing_marker() {
        let dir = tempfile::tempdir().unwrap();
        let root = CoordinationRoot::new(dir.path(), "x");
        let area = root.work_area(&Site::direct(0, "a"));
        area.prepare().unwrap();

        assert!(area.mark_ended("cancelled").await.unwrap());
        assert!(!area.mark_ended("0").await.unwrap());

        let content = std::fs::read_to_string(area.ended_marker()).unwrap();
        assert_eq!(content, "cancelled\n");
    }
}
