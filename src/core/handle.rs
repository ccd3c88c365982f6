//! Live handle to a long-running engine process.
//!
//! A supervisor task owns the child process. Output is delivered as an
//! ordered, finite stream of [`ProcessEvent`]s: every complete stdout and
//! stderr line, then exactly one [`ProcessEvent::Exited`]. Cancelling the
//! handle, or dropping it before the exit event, tears the process down.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::invoker::InvokeError;

/// How long a terminated process gets to exit before it is killed outright.
pub const TERMINATION_GRACE: Duration = Duration::from_secs(2);

/// How a started process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, `None` if the process was ended by a signal
    pub code: Option<i32>,

    /// Whether the process was torn down through [`ExecutionHandle::cancel`]
    pub cancelled: bool,
}

impl ProcessExit {
    /// Check if the process ran to completion with exit code 0.
    pub fn success(&self) -> bool {
        !self.cancelled && self.code == Some(0)
    }
}

/// Event from a running process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// A complete line of standard output
    Stdout(String),
    /// A complete line of standard error
    Stderr(String),
    /// The process has exited; always the last event
    Exited(ProcessExit),
}

/// Handle to one running process.
pub struct ExecutionHandle {
    program: String,
    pid: Option<u32>,
    stdout: mpsc::UnboundedReceiver<String>,
    stderr: mpsc::UnboundedReceiver<String>,
    exit: oneshot::Receiver<ProcessExit>,
    stdout_open: bool,
    stderr_open: bool,
    finished: bool,
    kill: CancellationToken,
}

impl std::fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("program", &self.program)
            .field("pid", &self.pid)
            .field("finished", &self.finished)
            .field("cancelled", &self.kill.is_cancelled())
            .finish()
    }
}

impl ExecutionHandle {
    pub(crate) fn spawn(mut command: Command, program: &str) -> Result<Self, InvokeError> {
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|source| InvokeError::Spawn { program: program.to_string(), source })?;
        let pid = child.id();

        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        let readers = [
            child.stdout.take().map(|out| tokio::spawn(forward_lines(out, stdout_tx))),
            child.stderr.take().map(|err| tokio::spawn(forward_lines(err, stderr_tx))),
        ];

        let kill = CancellationToken::new();
        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(supervise(child, pid, readers, kill.clone(), exit_tx));

        tracing::debug!(program, ?pid, "engine process started");

        Ok(Self {
            program: program.to_string(),
            pid,
            stdout: stdout_rx,
            stderr: stderr_rx,
            exit: exit_rx,
            stdout_open: true,
            stderr_open: true,
            finished: false,
            kill,
        })
    }

    /// Program this handle is running.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// OS process id, if the process was still alive when spawned.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the exit event has been delivered.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Ask the process to terminate.
    ///
    /// The process group receives SIGTERM and is killed if it is still alive
    /// after [`TERMINATION_GRACE`]. The exit event still arrives, with
    /// `cancelled` set.
    pub fn cancel(&self) {
        self.kill.cancel();
    }

    /// Whether [`ExecutionHandle::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        self.kill.is_cancelled()
    }

    /// Next event from the process, or `None` once the exit event has been
    /// delivered.
    ///
    /// Cancel safe: usable as a `tokio::select!` branch.
    pub async fn next_event(&mut self) -> Option<ProcessEvent> {
        loop {
            if self.finished {
                return None;
            }

            tokio::select! {
                line = self.stdout.recv(), if self.stdout_open => match line {
                    Some(line) => return Some(ProcessEvent::Stdout(line)),
                    None => self.stdout_open = false,
                },
                line = self.stderr.recv(), if self.stderr_open => match line {
                    Some(line) => return Some(ProcessEvent::Stderr(line)),
                    None => self.stderr_open = false,
                },
                exit = &mut self.exit, if !self.stdout_open && !self.stderr_open => {
                    self.finished = true;
                    let exit = exit.unwrap_or(ProcessExit {
                        code: None,
                        cancelled: self.kill.is_cancelled(),
                    });
                    return Some(ProcessEvent::Exited(exit));
                }
            }
        }
    }

    /// Wait for the process to exit, discarding any remaining output.
    pub async fn wait(mut self) -> ProcessExit {
        while let Some(event) = self.next_event().await {
            if let ProcessEvent::Exited(exit) = event {
                return exit;
            }
        }
        // Exit already consumed by an earlier `next_event` call.
        ProcessExit { code: None, cancelled: self.kill.is_cancelled() }
    }
}

impl Drop for ExecutionHandle {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!(program = %self.program, pid = ?self.pid, "handle abandoned, stopping process");
            self.kill.cancel();
        }
    }
}

/// Forward complete lines from `source` into `tx`.
///
/// A trailing fragment without a line terminator is discarded.
async fn forward_lines<R>(source: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(source);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() != Some(&b'\n') {
                    tracing::debug!(bytes = buf.len(), "discarding unterminated output");
                    break;
                }
                buf.pop();
                if buf.last() == Some(&b'\r') {
                    buf.pop();
                }
                if tx.send(String::from_utf8_lossy(&buf).into_owned()).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "output stream closed");
                break;
            }
        }
    }
}

async fn supervise(
    mut child: Child,
    pid: Option<u32>,
    readers: [Option<JoinHandle<()>>; 2],
    kill: CancellationToken,
    exit_tx: oneshot::Sender<ProcessExit>,
) {
    let (status, cancelled) = tokio::select! {
        status = child.wait() => (status, false),
        () = kill.cancelled() => (terminate(&mut child, pid).await, true),
    };

    for reader in readers.into_iter().flatten() {
        if cancelled {
            reader.abort();
            continue;
        }
        let abort = reader.abort_handle();
        if tokio::time::timeout(TERMINATION_GRACE, reader).await.is_err() {
            // Something outside the process still holds the pipe open.
            tracing::debug!(?pid, "output reader did not drain, aborting");
            abort.abort();
        }
    }

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::warn!(?pid, error = %e, "failed to wait for engine process");
            None
        }
    };

    let _ = exit_tx.send(ProcessExit { code, cancelled });
}

async fn terminate(child: &mut Child, pid: Option<u32>) -> std::io::Result<ExitStatus> {
    let signalled = pid.is_some_and(terminate_group);
    if !signalled {
        child.start_kill()?;
    }

    let status = match tokio::time::timeout(TERMINATION_GRACE, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            tracing::debug!(?pid, "process ignored termination, killing");
            if let Some(pid) = pid {
                kill_group(pid);
            }
            child.kill().await?;
            child.wait().await
        }
    };

    // Sweep anything left in the group after the leader has gone.
    if let Some(pid) = pid {
        kill_group(pid);
    }

    status
}

/// Send SIGTERM to the process group led by `pid`.
#[cfg(unix)]
fn terminate_group(pid: u32) -> bool {
    signal_group(pid, nix::sys::signal::Signal::SIGTERM)
}

/// Send SIGKILL to the process group led by `pid`.
#[cfg(unix)]
pub(crate) fn kill_group(pid: u32) -> bool {
    signal_group(pid, nix::sys::signal::Signal::SIGKILL)
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };

    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            tracing::debug!(pid, ?signal, error = %e, "failed to signal process group");
            false
        }
    }
}

#[cfg(not(unix))]
fn terminate_group(_pid: u32) -> bool {
    false
}

#[cfg(not(unix))]
pub(crate) fn kill_group(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::super::ProcessInvoker;
    use super::*;

    fn start(script: &str) -> ExecutionHandle {
        ProcessInvoker::new().start("sh", &["-c".to_string(), script.to_string()]).unwrap()
    }

    async fn collect(handle: &mut ExecutionHandle) -> (Vec<String>, Vec<String>, ProcessExit) {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Some(event) = handle.next_event().await {
            match event {
                ProcessEvent::Stdout(line) => stdout.push(line),
                ProcessEvent::Stderr(line) => stderr.push(line),
                ProcessEvent::Exited(exit) => return (stdout, stderr, exit),
            }
        }
        panic!("stream ended without an exit event");
    }

    /// Zombies count as gone: nothing may reap them inside a container.
    #[cfg(unix)]
    fn is_alive(pid: u32) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        if kill(Pid::from_raw(pid as i32), None).is_err() {
            return false;
        }
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat.rsplit(')').next().and_then(|rest| rest.trim_start().chars().next())
                != Some('Z'),
            Err(_) => true,
        }
    }

    #[test]
    fn test_process_exit_success() {
        assert!(ProcessExit { code: Some(0), cancelled: false }.success());
        assert!(!ProcessExit { code: Some(0), cancelled: true }.success());
        assert!(!ProcessExit { code: Some(2), cancelled: false }.success());
        assert!(!ProcessExit { code: None, cancelled: false }.success());
    }

    #[tokio::test]
    async fn test_streams_lines_in_order() {
        let mut handle = start("echo one; echo two; echo warn >&2; echo three");
        let (stdout, stderr, exit) = collect(&mut handle).await;

        assert_eq!(stdout, vec!["one", "two", "three"]);
        assert_eq!(stderr, vec!["warn"]);
        assert_eq!(exit, ProcessExit { code: Some(0), cancelled: false });
        assert!(handle.is_finished());
        assert!(handle.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_discards_unterminated_last_line() {
        let mut handle = start("echo complete; printf partial");
        let (stdout, _, exit) = collect(&mut handle).await;

        assert_eq!(stdout, vec!["complete"]);
        assert!(exit.success());
    }

    #[tokio::test]
    async fn test_strips_carriage_returns() {
        let mut handle = start("printf 'dos line\\r\\n'");
        let (stdout, _, _) = collect(&mut handle).await;

        assert_eq!(stdout, vec!["dos line"]);
    }

    #[tokio::test]
    async fn test_reports_non_zero_exit() {
        let mut handle = start("echo 'missing dependency' >&2; exit 2");
        let (_, stderr, exit) = collect(&mut handle).await;

        assert_eq!(stderr, vec!["missing dependency"]);
        assert_eq!(exit.code, Some(2));
        assert!(!exit.cancelled);
    }

    #[tokio::test]
    async fn test_spawn_error() {
        let err = ProcessInvoker::new().start("no-such-engine-binary-here", &[]).unwrap_err();
        assert!(matches!(err, InvokeError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_kills_process() {
        let mut handle = start("echo ready; sleep 30");
        let pid = handle.pid().unwrap();

        assert_eq!(handle.next_event().await, Some(ProcessEvent::Stdout("ready".to_string())));

        handle.cancel();
        let exit = tokio::time::timeout(Duration::from_secs(10), handle.wait()).await.unwrap();

        assert!(exit.cancelled);
        assert!(!exit.success());
        assert!(!is_alive(pid));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_reaches_grandchildren() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("child.pid");
        let script = format!("sleep 30 & echo $! > {}; echo ready; wait", pid_file.display());

        let mut handle = start(&script);
        assert_eq!(handle.next_event().await, Some(ProcessEvent::Stdout("ready".to_string())));

        let grandchild: u32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        assert!(is_alive(grandchild));

        handle.cancel();
        tokio::time::timeout(Duration::from_secs(10), handle.wait()).await.unwrap();

        // Reaped by init once orphaned; give it a moment.
        let mut alive = true;
        for _ in 0..50 {
            if !is_alive(grandchild) {
                alive = false;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!alive);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dropping_handle_stops_process() {
        let mut handle = start("echo ready; sleep 30");
        let pid = handle.pid().unwrap();
        assert!(handle.next_event().await.is_some());

        drop(handle);

        let mut alive = true;
        for _ in 0..250 {
            if !is_alive(pid) {
                alive = false;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!alive);
    }
}
