//! Run script generation
//!
//! Turns the user's script into the `run.sh` each site submits: scheduler
//! directives on top, lifecycle markers next, then the user's commands.

use fanout_core::domain::site::{SchedulerKind, Site};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use tracing::debug;

use crate::work_area::{HOSTNAME_FILE, OUTPUT_FILE, STARTED_MARKER, WorkArea, record_exit_status};

const DEFAULT_SHEBANG: &str = "#!/bin/bash";

/// Work area captured before the user's commands can change directory
const WORKDIR_VAR: &str = "FANOUT_WORKDIR";

/// Where the user's commands come from
#[derive(Debug, Clone)]
pub enum ScriptSource {
    Inline(String),
    /// An existing script on the local filesystem
    Existing(PathBuf),
}

#[derive(Debug, Clone)]
pub struct ScriptBuilder {
    source: ScriptSource,
    inject_markers: bool,
    reuse_existing: bool,
}

impl ScriptBuilder {
    pub fn new(source: ScriptSource) -> Self {
        Self {
            source,
            inject_markers: true,
            reuse_existing: false,
        }
    }

    /// Toggles the HOSTNAME/job.started/job.ended instrumentation
    pub fn inject_markers(mut self, enabled: bool) -> Self {
        self.inject_markers = enabled;
        self
    }

    /// Keeps a `run.sh` already present in the work area
    pub fn reuse_existing(mut self, enabled: bool) -> Self {
        self.reuse_existing = enabled;
        self
    }

    /// Writes `run-script.sh` and an executable `run.sh` into the work area
    pub async fn prepare(&self, site: &Site, area: &WorkArea) -> std::io::Result<PathBuf> {
        let run_script = area.run_script();

        if self.reuse_existing && tokio::fs::try_exists(&run_script).await? {
            debug!("Reusing {}", run_script.display());
            return Ok(run_script);
        }

        let body = match &self.source {
            ScriptSource::Inline(body) => body.clone(),
            ScriptSource::Existing(path) => tokio::fs::read_to_string(path).await?,
        };

        tokio::fs::write(area.user_script(), &body).await?;
        tokio::fs::write(&run_script, self.render(site, &body)).await?;
        tokio::fs::set_permissions(&run_script, std::fs::Permissions::from_mode(0o755)).await?;

        debug!("Wrote {} for {}", run_script.display(), site.id);
        Ok(run_script)
    }

    /// Renders the full `run.sh` text
    pub fn render(&self, site: &Site, body: &str) -> String {
        let (shebang, body) = match body.strip_prefix("#!") {
            Some(rest) => {
                let (first, remainder) = rest.split_once('\n').unwrap_or((rest, ""));
                (format!("#!{}", first.trim_end()), remainder)
            }
            None => (DEFAULT_SHEBANG.to_string(), body),
        };

        let mut lines = vec![shebang];
        lines.extend(directives(site));

        if site.kind == SchedulerKind::Pbs {
            lines.push("cd \"${PBS_O_WORKDIR:-.}\"".to_string());
        }

        if self.inject_markers {
            let workdir = format!("\"${}\"", WORKDIR_VAR);

            lines.push(format!("{}=\"$PWD\"", WORKDIR_VAR));
            lines.push(format!("trap '{}' EXIT", record_exit_status(&workdir)));
            lines.push(format!("hostname > {}/{}", workdir, HOSTNAME_FILE));
            lines.push(format!(
                "date -u +%Y-%m-%dT%H:%M:%SZ > {}/{}",
                workdir, STARTED_MARKER
            ));
        }

        let mut script = lines.join("\n");
        script.push('\n');
        script.push_str(body);
        if !script.ends_with('\n') {
            script.push('\n');
        }
        script
    }
}

fn directives(site: &Site) -> Vec<String> {
    let job_name = format!("fanout-{}", site.id);

    match site.kind {
        SchedulerKind::Direct => Vec::new(),
        SchedulerKind::Slurm => {
            let slurm = &site.slurm;
            let mut lines = vec![format!("#SBATCH --job-name={}", job_name)];

            if let Some(account) = &slurm.account {
                lines.push(format!("#SBATCH --account={}", account));
            }
            if let Some(partition) = &slurm.partition {
                lines.push(format!("#SBATCH --partition={}", partition));
            }
            lines.push(format!("#SBATCH --time={}", slurm.time));
            lines.push(format!("#SBATCH --nodes={}", slurm.nodes));
            if let Some(cpus) = slurm.cpus_per_task {
                lines.push(format!("#SBATCH --cpus-per-task={}", cpus));
            }
            lines.push(format!("#SBATCH --output={}", OUTPUT_FILE));
            lines.extend(slurm.directives.iter().map(|d| format!("#SBATCH {}", d)));
            lines
        }
        SchedulerKind::Pbs => {
            let pbs = &site.pbs;
            let mut lines = vec![format!("#PBS -N {}", job_name)];

            if let Some(account) = &pbs.account {
                lines.push(format!("#PBS -A {}", account));
            }
            if let Some(queue) = &pbs.queue {
                lines.push(format!("#PBS -q {}", queue));
            }
            lines.push(format!("#PBS -l walltime={}", pbs.walltime));
            lines.push(format!("#PBS -o {}", OUTPUT_FILE));
            lines.push("#PBS -j oe".to_string());
            lines.extend(pbs.directives.iter().map(|d| format!("#PBS {}", d)));
            lines
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work_area::{CoordinationRoot, ENDED_MARKER};

    fn slurm_site() -> Site {
        let mut site = Site::direct(1, "Site-1");
        site.kind = SchedulerKind::Slurm;
        site.slurm.account = Some("proj42".to_string());
        site.slurm.partition = Some("gpu".to_string());
        site.slurm.directives = vec!["--gres=gpu:1".to_string()];
        site
    }

    #[test]
    fn test_render_slurm_header() {
        let builder = ScriptBuilder::new(ScriptSource::Inline(String::new()));
        let script = builder.render(&slurm_site(), "#!/bin/sh\necho hi\n");

        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(lines[0], "#!/bin/sh");
        assert!(lines.contains(&"#SBATCH --account=proj42"));
        assert!(lines.contains(&"#SBATCH --partition=gpu"));
        assert!(lines.contains(&"#SBATCH --time=04:00:00"));
        assert!(lines.contains(&"#SBATCH --nodes=1"));
        assert!(lines.contains(&"#SBATCH --gres=gpu:1"));
        assert_eq!(*lines.last().unwrap(), "echo hi");
        // the user's shebang must not reappear mid-script
        assert_eq!(script.matches("#!").count(), 1);
    }

    #[test]
    fn test_render_pbs_header() {
        let mut site = Site::direct(0, "Site-0");
        site.kind = SchedulerKind::Pbs;
        site.pbs.queue = Some("short".to_string());

        let builder = ScriptBuilder::new(ScriptSource::Inline(String::new()));
        let script = builder.render(&site, "echo hi");

        assert!(script.starts_with("#!/bin/bash\n#PBS -N fanout-site_0\n"));
        assert!(script.contains("#PBS -q short\n"));
        assert!(script.contains("#PBS -l walltime=04:00:00\n"));
        assert!(script.contains("PBS_O_WORKDIR"));
        assert!(script.ends_with("echo hi\n"));
    }

    #[test]
    fn test_markers_optional() {
        let site = Site::direct(0, "Site-0");
        let with = ScriptBuilder::new(ScriptSource::Inline(String::new()));
        let without = with.clone().inject_markers(false);

        assert!(with.render(&site, "true").contains("job.ended"));
        assert!(with.render(&site, "true").contains("HOSTNAME"));
        assert!(!without.render(&site, "true").contains("job.ended"));
        assert!(!without.render(&site, "true").contains("#SBATCH"));
    }

    #[test]
    fn test_markers_follow_pbs_workdir() {
        let mut site = Site::direct(0, "Site-0");
        site.kind = SchedulerKind::Pbs;

        let script = ScriptBuilder::new(ScriptSource::Inline(String::new())).render(&site, "true");
        let lines: Vec<&str> = script.lines().collect();

        let cd = lines.iter().position(|l| l.contains("PBS_O_WORKDIR")).unwrap();
        let capture = lines
            .iter()
            .position(|l| l.starts_with("FANOUT_WORKDIR="))
            .unwrap();
        assert!(cd < capture);
    }

    #[tokio::test]
    async fn test_markers_land_in_work_area_after_cd() {
        let dir = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();

        let mut site = Site::direct(0, "Site-0");
        site.kind = SchedulerKind::Pbs;
        let area = CoordinationRoot::new(dir.path(), "e").work_area(&site);
        area.prepare().unwrap();

        let body = format!("cd {}\necho working\n", elsewhere.path().display());
        let builder = ScriptBuilder::new(ScriptSource::Inline(body));
        let run_script = builder.prepare(&site, &area).await.unwrap();

        let status = tokio::process::Command::new("sh")
            .arg(&run_script)
            .current_dir(area.path())
            .env_remove("PBS_O_WORKDIR")
            .output()
            .await
            .unwrap()
            .status;

        assert!(status.success());
        assert_eq!(
            std::fs::read_to_string(area.ended_marker()).unwrap(),
            "0\n"
        );
        assert!(area.path().join(HOSTNAME_FILE).exists());
        assert!(area.path().join(STARTED_MARKER).exists());
        assert!(!elsewhere.path().join(ENDED_MARKER).exists());
    }

    #[tokio::test]
    async fn test_prepare_writes_executable_scripts() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("user.sh");
        std::fs::write(&source, "#!/bin/bash\necho from file\n").unwrap();

        let site = Site::direct(0, "Site-0");
        let area = CoordinationRoot::new(dir.path(), "e").work_area(&site);
        area.prepare().unwrap();

        let builder = ScriptBuilder::new(ScriptSource::Existing(source));
        let run_script = builder.prepare(&site, &area).await.unwrap();

        let mode = std::fs::metadata(&run_script).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
        assert!(
            std::fs::read_to_string(area.user_script())
                .unwrap()
                .contains("echo from file")
        );
    }

    #[tokio::test]
    async fn test_prepare_reuses_existing_run_script() {
        let dir = tempfile::tempdir().unwrap();
        let site = Site::direct(0, "Site-0");
        let area = CoordinationRoot::new(dir.path(), "e").work_area(&site);
        area.prepare().unwrap();
        std::fs::write(area.run_script(), "#!/bin/sh\necho kept\n").unwrap();

        let builder =
            ScriptBuilder::new(ScriptSource::Inline("echo new".to_string())).reuse_existing(true);
        builder.prepare(&site, &area).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(area.run_script()).unwrap(),
            "#!/bin/sh\necho kept\n"
        );
    }
}
