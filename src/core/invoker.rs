//! Process invocation module.
//!
//! Spawns engine processes scoped to a working directory. Short calls go
//! through [`ProcessInvoker::run`], which captures output under a timeout.
//! Long-running calls go through [`ProcessInvoker::start`], which returns an
//! [`ExecutionHandle`] streaming output line by line.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::handle::{self, ExecutionHandle};

/// Ceiling applied to short synchronous calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors raised while invoking an external process.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    /// The executable could not be found or started.
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// A short call exceeded its ceiling and was killed.
    #[error("'{program}' timed out after {after:?}")]
    Timeout { program: String, after: Duration },

    /// The process ran but reported failure.
    #[error("'{program}' exited with {}: {}", exit_label(.code), stderr_label(.stderr))]
    NonZeroExit { program: String, code: Option<i32>, stderr: String },

    /// Pipe or wait failure after the process was spawned.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn exit_label(code: &Option<i32>) -> String {
    code.map_or_else(|| "a signal".to_string(), |c| format!("code {c}"))
}

fn stderr_label(stderr: &str) -> &str {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        "no error output"
    } else {
        trimmed
    }
}

/// Captured result of a short-lived process.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// Program that was run
    pub program: String,

    /// Exit code, `None` if the process was ended by a signal
    pub exit_code: Option<i32>,

    /// Standard output
    pub stdout: String,

    /// Standard error
    pub stderr: String,

    /// Time taken to execute
    pub duration: Duration,
}

impl ProcessOutput {
    /// Check if the process succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Get the exit code.
    pub fn code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Turn a non-zero exit into [`InvokeError::NonZeroExit`].
    ///
    /// Callers that treat a non-zero exit as data can skip this and inspect
    /// the output directly.
    pub fn check(self) -> Result<Self, InvokeError> {
        if self.success() {
            Ok(self)
        } else {
            Err(InvokeError::NonZeroExit {
                program: self.program,
                code: self.exit_code,
                stderr: self.stderr,
            })
        }
    }
}

/// Spawns engine processes.
#[derive(Debug, Clone)]
pub struct ProcessInvoker {
    /// Directory every process is started in
    working_dir: Option<PathBuf>,

    /// Ceiling for [`ProcessInvoker::run`]
    timeout: Duration,

    /// Extra environment variables
    env: HashMap<String, String>,
}

impl Default for ProcessInvoker {
    fn default() -> Self {
        Self { working_dir: None, timeout: DEFAULT_TIMEOUT, env: HashMap::new() }
    }
}

impl ProcessInvoker {
    /// Create a new invoker with the default timeout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the working directory.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set the timeout for short calls.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Add an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add several environment variables.
    #[must_use]
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env.extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// The configured working directory.
    pub fn dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    /// The configured timeout.
    pub fn timeout_duration(&self) -> Duration {
        self.timeout
    }

    fn command(&self, program: &str, args: &[String]) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(args);

        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }

        cmd.envs(&self.env);

        // Backstop for handles and futures dropped mid-flight.
        cmd.kill_on_drop(true);

        // Own process group so teardown reaches grandchildren too.
        #[cfg(unix)]
        cmd.process_group(0);

        cmd
    }

    /// Run a short-lived process and capture its output.
    pub async fn run(&self, program: &str, args: &[String]) -> Result<ProcessOutput, InvokeError> {
        self.run_with_input(program, args, None).await
    }

    /// Run a short-lived process, writing `input` to its standard input.
    ///
    /// The process is killed if it does not finish within the timeout.
    pub async fn run_with_input(
        &self,
        program: &str,
        args: &[String],
        input: Option<&str>,
    ) -> Result<ProcessOutput, InvokeError> {
        let start = Instant::now();

        let mut cmd = self.command(program, args);
        cmd.stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|source| InvokeError::Spawn { program: program.to_string(), source })?;
        let pid = child.id();

        tracing::debug!(program, ?args, ?pid, "spawned engine call");

        let stdin = child.stdin.take();
        let io = async move {
            if let (Some(input), Some(mut stdin)) = (input, stdin) {
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    // The process may legitimately exit without reading its input.
                    if e.kind() != std::io::ErrorKind::BrokenPipe {
                        return Err(e);
                    }
                }
            }
            child.wait_with_output().await
        };

        match tokio::time::timeout(self.timeout, io).await {
            Ok(Ok(output)) => Ok(ProcessOutput {
                program: program.to_string(),
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                duration: start.elapsed(),
            }),
            Ok(Err(e)) => Err(InvokeError::Io(e)),
            Err(_) => {
                // The child itself is killed on drop; sweep the rest of its group.
                if let Some(pid) = pid {
                    handle::kill_group(pid);
                }
                tracing::warn!(program, timeout = ?self.timeout, "engine call timed out");
                Err(InvokeError::Timeout { program: program.to_string(), after: self.timeout })
            }
        }
    }

    /// Start a long-running process and stream its output.
    ///
    /// Returns as soon as the process is spawned. No timeout applies.
    pub fn start(&self, program: &str, args: &[String]) -> Result<ExecutionHandle, InvokeError> {
        tracing::debug!(program, ?args, "starting engine execution");
        ExecutionHandle::spawn(self.command(program, args), program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[test]
    fn test_invoker_builder() {
        let invoker = ProcessInvoker::new()
            .working_dir("/tmp")
            .timeout(Duration::from_secs(5))
            .env("A", "1");

        assert_eq!(invoker.dir(), Some(Path::new("/tmp")));
        assert_eq!(invoker.timeout_duration(), Duration::from_secs(5));
        assert_eq!(invoker.env.get("A").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_default_timeout() {
        assert_eq!(ProcessInvoker::new().timeout_duration(), DEFAULT_TIMEOUT);
    }

    #[tokio::test]
    async fn test_run_captures_output() {
        let invoker = ProcessInvoker::new();
        let output = invoker.run("sh", &sh("echo hello; echo oops >&2")).await.unwrap();

        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_run_reports_exit_code() {
        let invoker = ProcessInvoker::new();
        let output = invoker.run("sh", &sh("echo broken >&2; exit 3")).await.unwrap();

        assert!(!output.success());
        assert_eq!(output.code(), Some(3));

        match output.check() {
            Err(InvokeError::NonZeroExit { code, stderr, .. }) => {
                assert_eq!(code, Some(3));
                assert!(stderr.contains("broken"));
            }
            other => panic!("expected NonZeroExit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_with_working_dir_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = ProcessInvoker::new().working_dir(dir.path()).env("GREETING", "hi");

        let output = invoker.run("sh", &sh("pwd; echo $GREETING")).await.unwrap();
        let expected = dir.path().canonicalize().unwrap();

        let mut lines = output.stdout.lines();
        assert_eq!(Path::new(lines.next().unwrap()).canonicalize().unwrap(), expected);
        assert_eq!(lines.next(), Some("hi"));
    }

    #[tokio::test]
    async fn test_run_with_input() {
        let invoker = ProcessInvoker::new();
        let output =
            invoker.run_with_input("sh", &sh("cat"), Some("{\"code\":1}")).await.unwrap();

        assert_eq!(output.stdout, "{\"code\":1}");
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let invoker = ProcessInvoker::new().timeout(Duration::from_millis(200));
        let start = Instant::now();

        let err = invoker.run("sh", &sh("sleep 10")).await.unwrap_err();

        assert!(matches!(err, InvokeError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_spawn_error() {
        let invoker = ProcessInvoker::new();
        let err = invoker.run("definitely-not-a-real-engine-binary", &[]).await.unwrap_err();

        assert!(matches!(err, InvokeError::Spawn { .. }));
        assert!(err.to_string().contains("definitely-not-a-real-engine-binary"));
    }

    #[test]
    fn test_non_zero_exit_message() {
        let err = InvokeError::NonZeroExit {
            program: "maahelper".to_string(),
            code: None,
            stderr: "  ".to_string(),
        };
        assert_eq!(err.to_string(), "'maahelper' exited with a signal: no error output");
    }
}
