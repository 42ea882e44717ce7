//! Child process helpers.
//!
//! Two shapes are supported:
//! - [`run_command_with_timeout`]: short-lived tool invocations (`git`, `gh`)
//!   with captured, size-bounded output and a wall-clock timeout.
//! - [`stream_command`]: the long-running agent, whose stdout/stderr are
//!   streamed line by line into a [`LineSink`] while a cancellation token is
//!   watched.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use nix::sys::signal::Signal;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::io::supervisor::send_group_signal;

/// Prefix applied to agent stderr lines in the log sink.
pub const STDERR_PREFIX: &str = "[ERR] ";

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

/// Which child stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Shared, line-oriented log file that both drain tasks write into.
///
/// Each line is written and flushed under the lock, so interleaved stdout and
/// stderr lines never tear. With `echo` set, lines are also mirrored to the
/// terminal (stdout to stdout, stderr to stderr, unprefixed).
#[derive(Debug, Clone)]
pub struct LineSink {
    writer: Arc<Mutex<BufWriter<File>>>,
    path: PathBuf,
    echo: bool,
}

impl LineSink {
    /// Create (truncate) the log file at `path`.
    pub fn create(path: &Path, echo: bool) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create log dir {}", parent.display()))?;
        }
        let file = File::create(path).with_context(|| format!("create log {}", path.display()))?;
        Ok(Self::from_file(file, path, echo))
    }

    /// Open `path` for appending, creating it if missing.
    pub fn append(path: &Path, echo: bool) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create log dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log {}", path.display()))?;
        Ok(Self::from_file(file, path, echo))
    }

    fn from_file(file: File, path: &Path, echo: bool) -> Self {
        Self {
            writer: Arc::new(Mutex::new(BufWriter::new(file))),
            path: path.to_path_buf(),
            echo,
        }
    }

    /// Write free-form text to the log only (never echoed).
    pub fn write_text(&self, text: &str) -> Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow!("log writer lock poisoned"))?;
        writer
            .write_all(text.as_bytes())
            .and_then(|()| writer.flush())
            .with_context(|| format!("write log {}", self.path.display()))
    }

    /// Record one child output line, newline-terminating it if needed.
    pub fn write_line(&self, kind: StreamKind, line: &[u8]) -> std::io::Result<()> {
        if self.echo {
            echo_line(kind, line);
        }
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| std::io::Error::other("log writer lock poisoned"))?;
        if kind == StreamKind::Stderr {
            writer.write_all(STDERR_PREFIX.as_bytes())?;
        }
        writer.write_all(line)?;
        if !line.ends_with(b"\n") {
            writer.write_all(b"\n")?;
        }
        writer.flush()
    }
}

fn echo_line(kind: StreamKind, line: &[u8]) {
    let result = match kind {
        StreamKind::Stdout => {
            let mut out = std::io::stdout().lock();
            out.write_all(line).and_then(|()| out.flush())
        }
        StreamKind::Stderr => {
            let mut err = std::io::stderr().lock();
            err.write_all(line).and_then(|()| err.flush())
        }
    };
    if let Err(err) = result {
        debug!(err = %err, "terminal echo failed");
    }
}

/// Result of a streamed child run.
#[derive(Debug)]
pub struct StreamOutcome {
    pub status: ExitStatus,
    /// True when the token fired before the child exited on its own.
    pub cancelled: bool,
    pub stdout_lines: u64,
    pub stderr_lines: u64,
    /// True when leftover processes still held the pipes after the child
    /// exited and draining was cut off.
    pub drain_abandoned: bool,
}

/// Spawn `cmd`, stream its output into `sink`, and wait for it under `cancel`.
///
/// The child leads its own process group. On cancellation the whole group
/// receives SIGTERM, then SIGKILL if the child is still alive after `grace`.
/// Once the child has exited the pipes get at most `grace` to reach EOF;
/// background processes still holding them are terminated and the readers
/// abandoned. Spawn failures are returned as the raw `io::Error` so callers
/// can tell a missing binary apart from a failed run.
#[instrument(skip_all, fields(grace_secs = grace.as_secs()))]
pub async fn stream_command(
    mut cmd: tokio::process::Command,
    sink: &LineSink,
    cancel: &CancellationToken,
    grace: Duration,
) -> Result<std::result::Result<StreamOutcome, std::io::Error>> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            error!(err = %err, "failed to spawn child");
            return Ok(Err(err));
        }
    };
    let pgid = child.id();
    debug!(pid = ?pgid, "child spawned");

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_lines = Arc::new(AtomicU64::new(0));
    let stderr_lines = Arc::new(AtomicU64::new(0));
    let mut stdout_task = tokio::spawn(drain_lines(
        stdout,
        sink.clone(),
        StreamKind::Stdout,
        Arc::clone(&stdout_lines),
    ));
    let mut stderr_task = tokio::spawn(drain_lines(
        stderr,
        sink.clone(),
        StreamKind::Stderr,
        Arc::clone(&stderr_lines),
    ));

    let waited = tokio::select! {
        status = child.wait() => Some(status.context("wait for child")?),
        () = cancel.cancelled() => None,
    };
    let (status, cancelled) = match waited {
        Some(status) => (status, false),
        None => (terminate(&mut child, pgid, grace).await?, true),
    };

    let drained = tokio::time::timeout(grace, async {
        let stdout = (&mut stdout_task).await;
        let stderr = (&mut stderr_task).await;
        (stdout, stderr)
    })
    .await;
    let drain_abandoned = match drained {
        Ok((stdout, stderr)) => {
            stdout.context("join stdout reader")?.context("read child stdout")?;
            stderr.context("join stderr reader")?.context("read child stderr")?;
            false
        }
        Err(_) => {
            warn!(
                grace_secs = grace.as_secs(),
                "child exited but its output pipes stayed open, terminating leftovers"
            );
            if let Some(pgid) = pgid {
                signal_group(pgid, Signal::SIGTERM);
            }
            stdout_task.abort();
            stderr_task.abort();
            true
        }
    };

    let stdout_lines = stdout_lines.load(Ordering::Relaxed);
    let stderr_lines = stderr_lines.load(Ordering::Relaxed);
    debug!(exit_code = ?status.code(), cancelled, stdout_lines, stderr_lines, "child finished");
    Ok(Ok(StreamOutcome {
        status,
        cancelled,
        stdout_lines,
        stderr_lines,
        drain_abandoned,
    }))
}

/// SIGTERM to the group, bounded wait, then SIGKILL to the group.
async fn terminate(
    child: &mut tokio::process::Child,
    pgid: Option<u32>,
    grace: Duration,
) -> Result<ExitStatus> {
    if let Some(pgid) = pgid {
        debug!(pgid, "cancellation requested, sending SIGTERM to process group");
        signal_group(pgid, Signal::SIGTERM);
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status.context("wait for child after SIGTERM"),
        Err(_) => {
            warn!(grace_secs = grace.as_secs(), "child ignored SIGTERM, killing");
            if let Some(pgid) = pgid {
                signal_group(pgid, Signal::SIGKILL);
            }
            child.kill().await.context("kill child")?;
            child.wait().await.context("wait for child after kill")
        }
    }
}

fn signal_group(pgid: u32, signal: Signal) {
    match send_group_signal(pgid, signal) {
        Ok(()) | Err(nix::Error::ESRCH) => {}
        Err(err) => warn!(pgid, err = %err, ?signal, "failed to signal process group"),
    }
}

async fn drain_lines<R>(
    reader: R,
    sink: LineSink,
    kind: StreamKind,
    count: Arc<AtomicU64>,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Ok(());
        }
        if let Err(err) = sink.write_line(kind, &line) {
            warn!(err = %err, ?kind, "failed to write child output to log");
        }
        count.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn timeout_kills_and_reports() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 5");
        let output =
            run_command_with_timeout(cmd, Duration::from_millis(100), 1024).expect("run");
        assert!(output.timed_out);
        assert!(!output.success());
    }

    #[test]
    fn captures_output_with_limit() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("printf 'abcdef'; printf 'oops' >&2");
        let output = run_command_with_timeout(cmd, Duration::from_secs(5), 3).expect("run");
        assert!(output.success());
        assert_eq!(output.stdout, b"abc");
        assert_eq!(output.stdout_truncated, 3);
        assert_eq!(output.stderr_text(), "oop");
    }

    #[tokio::test]
    async fn streams_both_pipes_with_stderr_prefix() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("out.log");
        let sink = LineSink::create(&path, false).expect("sink");
        let token = CancellationToken::new();

        let outcome = stream_command(
            sh("echo one; echo two >&2; printf 'three'"),
            &sink,
            &token,
            Duration::from_secs(1),
        )
        .await
        .expect("run")
        .expect("spawn");

        assert!(outcome.status.success());
        assert!(!outcome.cancelled);
        assert_eq!(outcome.stdout_lines, 2);
        assert_eq!(outcome.stderr_lines, 1);
        let log = std::fs::read_to_string(&path).expect("read log");
        assert!(log.contains("one\n"));
        assert!(log.contains("[ERR] two\n"));
        assert!(log.contains("three\n"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported_not_errored() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sink = LineSink::create(&temp.path().join("out.log"), false).expect("sink");
        let outcome = stream_command(
            sh("exit 3"),
            &sink,
            &CancellationToken::new(),
            Duration::from_secs(1),
        )
        .await
        .expect("run")
        .expect("spawn");
        assert_eq!(outcome.status.code(), Some(3));
    }

    #[tokio::test]
    async fn missing_binary_surfaces_spawn_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sink = LineSink::create(&temp.path().join("out.log"), false).expect("sink");
        let result = stream_command(
            tokio::process::Command::new("definitely-not-a-real-binary-ralph"),
            &sink,
            &CancellationToken::new(),
            Duration::from_secs(1),
        )
        .await
        .expect("run");
        let err = result.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn cancellation_terminates_and_drains() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("out.log");
        let sink = LineSink::create(&path, false).expect("sink");
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let outcome = stream_command(
            sh("echo started; exec sleep 30"),
            &sink,
            &token,
            Duration::from_secs(5),
        )
        .await
        .expect("run")
        .expect("spawn");

        assert!(outcome.cancelled);
        assert!(!outcome.status.success());
        assert!(started.elapsed() < Duration::from_secs(10));
        let log = std::fs::read_to_string(&path).expect("read log");
        assert!(log.contains("started"));
    }

    #[tokio::test]
    async fn stubborn_child_is_killed_after_grace() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sink = LineSink::create(&temp.path().join("out.log"), false).expect("sink");
        let token = CancellationToken::new();
        token.cancel();

        let started = Instant::now();
        let outcome = stream_command(
            sh("trap '' TERM; echo ready; while true; do sleep 1; done"),
            &sink,
            &token,
            Duration::from_millis(200),
        )
        .await
        .expect("run")
        .expect("spawn");

        assert!(outcome.cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancellation_reaches_background_grandchildren() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("out.log");
        let sink = LineSink::create(&path, false).expect("sink");
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        // The backgrounded sleep inherits both pipes and outlives its parent
        // unless the whole group is signalled.
        let started = Instant::now();
        let outcome = stream_command(
            sh("sleep 8 & echo started; exec sleep 60"),
            &sink,
            &token,
            Duration::from_secs(1),
        )
        .await
        .expect("run")
        .expect("spawn");

        assert!(outcome.cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
        let log = std::fs::read_to_string(&path).expect("read log");
        assert!(log.contains("started"));
    }

    #[tokio::test]
    async fn exited_child_with_lingering_pipe_holder_returns_after_grace() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("out.log");
        let sink = LineSink::create(&path, false).expect("sink");

        let started = Instant::now();
        let outcome = stream_command(
            sh("sleep 30 & echo done"),
            &sink,
            &CancellationToken::new(),
            Duration::from_millis(500),
        )
        .await
        .expect("run")
        .expect("spawn");

        assert!(outcome.status.success());
        assert!(!outcome.cancelled);
        assert!(outcome.drain_abandoned);
        assert_eq!(outcome.stdout_lines, 1);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(std::fs::read_to_string(&path).expect("read log").contains("done"));
    }
}
