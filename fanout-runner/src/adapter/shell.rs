//! Command execution on a site
//!
//! Every scheduler command (submit, status query, cancel) is a short shell
//! snippet run inside the site's work area, either locally or over ssh when
//! the site names a host. The snippet always runs through `sh -c` on the
//! target side so quoting behaves the same in both cases.

use fanout_core::domain::site::Resource;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Captured result of one command
#[derive(Debug, Clone)]
pub struct ShellOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs shell snippets in a work area, locally or on a remote host
#[derive(Debug, Clone)]
pub struct Shell {
    target: Option<String>,
    workdir: PathBuf,
    /// Searched before the inherited PATH
    #[cfg(test)]
    bin: Option<PathBuf>,
}

impl Shell {
    /// Creates a shell bound to `workdir` on the host described by `resource`
    pub fn new(resource: &Resource, workdir: impl Into<PathBuf>) -> Self {
        Self {
            target: resource.ssh_target(),
            workdir: workdir.into(),
            #[cfg(test)]
            bin: None,
        }
    }

    /// Shell running on the local machine
    #[cfg(test)]
    pub fn local(workdir: impl Into<PathBuf>) -> Self {
        Self {
            target: None,
            workdir: workdir.into(),
            bin: None,
        }
    }

    /// Resolves commands from `dir` first, for stand-in scheduler tools
    #[cfg(test)]
    pub fn with_bin(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bin = Some(dir.into());
        self
    }

    pub fn is_remote(&self) -> bool {
        self.target.is_some()
    }

    /// Runs `script` and captures its output
    ///
    /// The child is killed if the returned future is dropped, so callers can
    /// bound the call with `tokio::time::timeout`.
    pub async fn run(&self, script: &str) -> std::io::Result<ShellOutput> {
        let mut command = self.command(script);

        debug!(
            "Running on {}: {}",
            self.target.as_deref().unwrap_or("localhost"),
            script
        );

        let output = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        let result = ShellOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };

        if !result.stdout.trim().is_empty() {
            debug!("stdout: {}", result.stdout.trim());
        }
        if !result.stderr.trim().is_empty() {
            debug!("stderr: {}", result.stderr.trim());
        }

        Ok(result)
    }

    fn command(&self, script: &str) -> Command {
        match &self.target {
            None => {
                let mut command = Command::new("sh");
                command.arg("-c").arg(script).current_dir(&self.workdir);

                #[cfg(test)]
                if let Some(bin) = &self.bin {
                    let inherited = std::env::var("PATH").unwrap_or_default();
                    command.env("PATH", format!("{}:{}", bin.display(), inherited));
                }

                command
            }
            Some(target) => {
                let remote = format!(
                    "cd {} && sh -c {}",
                    quote(&self.workdir.to_string_lossy()),
                    quote(script)
                );
                let mut command = Command::new("ssh");
                command
                    .arg("-o")
                    .arg("BatchMode=yes")
                    .arg(target)
                    .arg(remote);
                command
            }
        }
    }
}

/// Single-quotes `value` for a POSIX shell
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote() {
        assert_eq!(quote("plain"), "'plain'");
        assert_eq!(quote("it's"), r"'it'\''s'");
        assert_eq!(quote("/a b/c"), "'/a b/c'");
    }

    #[test]
    fn test_remote_only_with_host() {
        let local = Shell::new(&Resource::default(), "/tmp");
        assert!(!local.is_remote());

        let remote = Shell::new(
            &Resource {
                host: Some("hpc".to_string()),
                user: None,
            },
            "/tmp",
        );
        assert!(remote.is_remote());
    }

    #[tokio::test]
    async fn test_run_captures_output_in_workdir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker"), "42").unwrap();

        let shell = Shell::local(dir.path());
        let output = shell.run("cat marker; echo oops >&2; exit 3").await.unwrap();

        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout.trim(), "42");
        assert_eq!(output.stderr.trim(), "oops");
        assert!(!output.success());
    }
}
