//! External command execution.
//!
//! Everything that shells out (the git history backend, the docker loader)
//! goes through a [`CommandRunner`] handed in by the caller, so tests can
//! substitute a recording fake.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use crate::error::{MergeError, Result};

/// Maximum output size kept per stream (stdout/stderr): 16 MiB.
pub const MAX_OUTPUT_BYTES: usize = 16 * 1024 * 1024;

/// A command to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program name or path.
    pub program: String,
    /// Arguments, not shell-interpreted.
    pub args: Vec<String>,
    /// Working directory for the command.
    pub working_dir: Option<PathBuf>,
    /// Additional environment variables.
    pub env: BTreeMap<String, String>,
    /// Kill the command if it runs longer than this.
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Human-readable command line for logs and errors.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Output from an executed command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Captured stdout bytes.
    pub stdout: Vec<u8>,
    /// Captured stderr bytes.
    pub stderr: Vec<u8>,
    /// Process exit code (-1 when killed by a signal).
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Runs external commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion. A non-zero exit is not an error here.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Run a command and fail with [`MergeError::CommandFailed`] on non-zero exit.
    async fn run_checked(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let output = self.run(spec).await?;
        if !output.success() {
            return Err(MergeError::CommandFailed {
                command: spec.display(),
                code: output.exit_code,
                stderr: output.stderr_str().trim().to_string(),
            });
        }
        Ok(output)
    }
}

/// [`CommandRunner`] backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        tracing::debug!(command = %spec.display(), "Running command");

        let mut child = command.spawn().map_err(|e| MergeError::CommandFailed {
            command: spec.display(),
            code: -1,
            stderr: format!("failed to spawn: {}", e),
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let work = async {
            let (stdout, stderr, status) =
                tokio::join!(read_capped(stdout), read_capped(stderr), child.wait());
            status.map(|status| (stdout, stderr, status))
        };

        let finished = match spec.timeout {
            Some(limit) => tokio::time::timeout(limit, work).await.ok(),
            None => Some(work.await),
        };
        let Some(finished) = finished else {
            child.kill().await.ok();
            tracing::warn!(command = %spec.display(), "Command timed out, killed");
            return Err(MergeError::TimeoutError(format!(
                "`{}` exceeded {:?}",
                spec.display(),
                spec.timeout.unwrap_or_default()
            )));
        };

        let (stdout, stderr, status) = finished?;
        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code: status.code().unwrap_or(-1),
        })
    }
}

/// Collect up to `MAX_OUTPUT_BYTES` of a stream, draining the rest so the
/// child never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(stream: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        let _ = (&mut stream)
            .take(MAX_OUTPUT_BYTES as u64)
            .read_to_end(&mut buf)
            .await;
        let _ = tokio::io::copy(&mut stream, &mut tokio::io::sink()).await;
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_spec_builder_and_display() {
        let spec = CommandSpec::new("git")
            .args(["merge", "--no-edit"])
            .arg("src-1")
            .env("GIT_AUTHOR_DATE", "1523820568 -0700")
            .current_dir("/tmp/repo");
        assert_eq!(spec.display(), "git merge --no-edit src-1");
        assert_eq!(spec.working_dir, Some(PathBuf::from("/tmp/repo")));
        assert_eq!(spec.env["GIT_AUTHOR_DATE"], "1523820568 -0700");
        assert!(spec.timeout.is_none());
    }

    #[tokio::test]
    async fn test_system_runner_captures_output() {
        let spec = CommandSpec::new("sh").args(["-c", "echo hello; echo oops >&2"]);
        let output = SystemRunner::new().run(&spec).await.unwrap();
        assert!(output.success());
        assert_eq!(output.stdout_str(), "hello\n");
        assert_eq!(output.stderr_str(), "oops\n");
    }

    #[tokio::test]
    async fn test_system_runner_non_zero_exit() {
        let spec = CommandSpec::new("sh").args(["-c", "exit 3"]);
        let output = SystemRunner::new().run(&spec).await.unwrap();
        assert_eq!(output.exit_code, 3);

        let err = SystemRunner::new().run_checked(&spec).await.unwrap_err();
        assert!(matches!(err, MergeError::CommandFailed { code: 3, .. }));
    }

    #[tokio::test]
    async fn test_system_runner_env_and_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let spec = CommandSpec::new("sh")
            .args(["-c", "echo $IMAGEMERGE_TEST; pwd"])
            .env("IMAGEMERGE_TEST", "value")
            .current_dir(dir.path());
        let output = SystemRunner::new().run_checked(&spec).await.unwrap();
        let stdout = output.stdout_str();
        let mut lines = stdout.lines();
        assert_eq!(lines.next(), Some("value"));
        let pwd = PathBuf::from(lines.next().unwrap());
        assert_eq!(
            pwd.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn test_system_runner_timeout_kills() {
        let spec = CommandSpec::new("sleep")
            .arg("5")
            .timeout(Some(Duration::from_millis(100)));
        let start = Instant::now();
        let err = SystemRunner::new().run(&spec).await.unwrap_err();
        assert!(matches!(err, MergeError::TimeoutError(_)));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_system_runner_missing_program() {
        let spec = CommandSpec::new("imagemerge-no-such-binary");
        let err = SystemRunner::new().run(&spec).await.unwrap_err();
        assert!(matches!(err, MergeError::CommandFailed { code: -1, .. }));
    }

    #[tokio::test]
    async fn test_system_runner_drains_large_output() {
        let spec = CommandSpec::new("sh")
            .args(["-c", "head -c 200000 /dev/zero; echo done >&2"])
            .timeout(Some(Duration::from_secs(30)));
        let output = SystemRunner::new().run_checked(&spec).await.unwrap();
        assert_eq!(output.stdout.len(), 200_000);
        assert_eq!(output.stderr_str(), "done\n");
    }
}
