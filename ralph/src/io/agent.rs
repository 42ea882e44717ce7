//! Agent abstraction and the `claude` CLI backend.
//!
//! The [`Agent`] trait decouples the run loop from the actual coding agent.
//! Tests use scripted agents that mutate the backlog without spawning
//! processes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::types::Sandbox;
use crate::errors::{InvokeError, SetupError};
use crate::io::process::{LineSink, stream_command};

/// Time the agent gets to exit after SIGTERM before it is killed.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(10);

const MAC_SANDBOX_PROFILE: &str = "(version 1)(allow default)";

/// Upper bound on `docker sandbox --help` during preflight.
const DOCKER_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// One agent call.
#[derive(Debug, Clone, Copy)]
pub struct InvokeRequest<'a> {
    /// Project root; the agent runs with this as its working directory.
    pub workdir: &'a Path,
    pub prompt: &'a str,
    /// Destination for interleaved stdout/stderr lines.
    pub sink: &'a LineSink,
    pub cancel: &'a CancellationToken,
}

#[async_trait]
pub trait Agent: Send + Sync {
    /// Verify the agent can be launched at all. Runs once before the loop.
    async fn preflight(&self) -> Result<(), SetupError>;

    /// Run one iteration to completion, cancellation, or failure.
    async fn invoke(&self, request: InvokeRequest<'_>) -> Result<(), InvokeError>;
}

/// Runs the `claude` CLI, optionally inside a sandbox.
#[derive(Debug, Clone)]
pub struct ClaudeAgent {
    pub binary: String,
    pub model: Option<String>,
    pub sandbox: Sandbox,
    pub grace: Duration,
}

impl ClaudeAgent {
    pub fn new(binary: impl Into<String>, model: Option<String>, sandbox: Sandbox) -> Self {
        Self {
            binary: binary.into(),
            model,
            sandbox,
            grace: DEFAULT_GRACE,
        }
    }

    /// Arguments passed to the agent binary itself.
    pub fn agent_args(&self, prompt: &str) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            "--dangerously-skip-permissions".to_string(),
        ];
        if let Some(model) = self.model.as_deref().filter(|m| !m.trim().is_empty()) {
            args.push("--model".to_string());
            args.push(model.to_string());
        }
        args.push("-p".to_string());
        args.push(prompt.to_string());
        args
    }

    /// Full program and argv for the configured sandbox.
    ///
    /// `resolved` is the agent binary's location on `PATH`; the docker
    /// sandbox resolves the agent inside the container and uses the bare name.
    pub fn command_line(&self, resolved: &Path, prompt: &str) -> (String, Vec<String>) {
        let agent_args = self.agent_args(prompt);
        match self.sandbox {
            Sandbox::None => (resolved.display().to_string(), agent_args),
            Sandbox::Docker => {
                let mut args = vec![
                    "sandbox".to_string(),
                    "run".to_string(),
                    self.binary.clone(),
                    ".".to_string(),
                    "--".to_string(),
                ];
                args.extend(agent_args);
                ("docker".to_string(), args)
            }
            Sandbox::Mac => {
                let mut args = vec![
                    "-p".to_string(),
                    MAC_SANDBOX_PROFILE.to_string(),
                    resolved.display().to_string(),
                ];
                args.extend(agent_args);
                ("sandbox-exec".to_string(), args)
            }
        }
    }

    fn resolve_agent(&self) -> Result<PathBuf, SetupError> {
        match self.sandbox {
            Sandbox::Docker => Ok(PathBuf::from(&self.binary)),
            Sandbox::None | Sandbox::Mac => {
                resolve_on_path(&self.binary).ok_or_else(|| SetupError::AgentNotFound {
                    binary: self.binary.clone(),
                })
            }
        }
    }
}

#[async_trait]
impl Agent for ClaudeAgent {
    #[instrument(skip_all, fields(binary = %self.binary, sandbox = %self.sandbox))]
    async fn preflight(&self) -> Result<(), SetupError> {
        match self.sandbox {
            Sandbox::None => {
                self.resolve_agent()?;
            }
            Sandbox::Mac => {
                self.resolve_agent()?;
                require_on_path("sandbox-exec")?;
            }
            Sandbox::Docker => {
                let docker = require_on_path("docker")?;
                if !docker_sandbox_available(&docker, DOCKER_CHECK_TIMEOUT).await {
                    return Err(SetupError::AgentNotFound {
                        binary: "docker sandbox".to_string(),
                    });
                }
            }
        }
        debug!("agent preflight passed");
        Ok(())
    }

    #[instrument(skip_all, fields(binary = %self.binary, sandbox = %self.sandbox))]
    async fn invoke(&self, request: InvokeRequest<'_>) -> Result<(), InvokeError> {
        if request.cancel.is_cancelled() {
            return Err(InvokeError::Cancelled);
        }
        let resolved = self.resolve_agent().map_err(|err| InvokeError::Spawn {
            binary: self.binary.clone(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, err.to_string()),
        })?;
        let (program, args) = self.command_line(&resolved, request.prompt);
        info!(program = %program, workdir = %request.workdir.display(), "starting agent");

        let mut cmd = tokio::process::Command::new(&program);
        cmd.args(&args).current_dir(request.workdir);

        let outcome = stream_command(cmd, request.sink, request.cancel, self.grace)
            .await?
            .map_err(|source| InvokeError::Spawn {
                binary: program.clone(),
                source,
            })?;

        if outcome.cancelled {
            info!(exit_code = ?outcome.status.code(), "agent stopped by cancellation");
            return Err(InvokeError::Cancelled);
        }
        if !outcome.status.success() {
            warn!(exit_code = ?outcome.status.code(), "agent failed");
            return Err(InvokeError::Exited {
                code: outcome.status.code(),
            });
        }
        debug!(
            stdout_lines = outcome.stdout_lines,
            stderr_lines = outcome.stderr_lines,
            "agent completed"
        );
        Ok(())
    }
}

fn require_on_path(binary: &str) -> Result<PathBuf, SetupError> {
    resolve_on_path(binary).ok_or_else(|| SetupError::AgentNotFound {
        binary: binary.to_string(),
    })
}

/// Whether `docker sandbox` is installed, without blocking the runtime.
async fn docker_sandbox_available(docker: &Path, timeout: Duration) -> bool {
    let mut cmd = tokio::process::Command::new(docker);
    cmd.args(["sandbox", "--help"])
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true);
    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => output.status.success(),
        Ok(Err(err)) => {
            debug!(err = %err, "docker sandbox check failed to run");
            false
        }
        Err(_) => {
            warn!(timeout_secs = timeout.as_secs(), "docker sandbox check timed out");
            false
        }
    }
}

/// Locate an executable the way a shell would.
///
/// Names containing a `/` are checked directly; bare names are searched in
/// each `PATH` entry.
pub fn resolve_on_path(binary: &str) -> Option<PathBuf> {
    if binary.trim().is_empty() {
        return None;
    }
    if binary.contains('/') {
        let path = PathBuf::from(binary);
        return is_executable(&path).then_some(path);
    }
    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .map(|dir| dir.join(binary))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        let mut perms = std::fs::metadata(&path).expect("meta").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("chmod");
        path
    }

    #[test]
    fn resolves_shell_and_rejects_unknown() {
        assert!(resolve_on_path("sh").is_some());
        assert!(resolve_on_path("ralph-no-such-agent-binary").is_none());
        assert!(resolve_on_path("").is_none());
    }

    #[test]
    fn explicit_paths_need_exec_bit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = write_script(temp.path(), "agent", "exit 0");
        assert_eq!(resolve_on_path(script.to_str().expect("utf8")), Some(script));

        let plain = temp.path().join("notes.txt");
        std::fs::write(&plain, "x").expect("write");
        assert!(resolve_on_path(plain.to_str().expect("utf8")).is_none());
    }

    #[test]
    fn command_lines_per_sandbox() {
        let resolved = Path::new("/usr/local/bin/claude");
        let mut agent = ClaudeAgent::new("claude", Some("opus".to_string()), Sandbox::None);
        let (program, args) = agent.command_line(resolved, "go");
        assert_eq!(program, "/usr/local/bin/claude");
        assert_eq!(
            args,
            vec![
                "--print",
                "--dangerously-skip-permissions",
                "--model",
                "opus",
                "-p",
                "go"
            ]
        );

        agent.model = None;
        agent.sandbox = Sandbox::Docker;
        let (program, args) = agent.command_line(resolved, "go");
        assert_eq!(program, "docker");
        assert_eq!(
            args,
            vec![
                "sandbox",
                "run",
                "claude",
                ".",
                "--",
                "--print",
                "--dangerously-skip-permissions",
                "-p",
                "go"
            ]
        );

        agent.sandbox = Sandbox::Mac;
        let (program, args) = agent.command_line(resolved, "go");
        assert_eq!(program, "sandbox-exec");
        assert_eq!(args[..3], ["-p", MAC_SANDBOX_PROFILE, "/usr/local/bin/claude"]);
    }

    #[tokio::test]
    async fn preflight_reports_missing_binary() {
        let agent = ClaudeAgent::new("ralph-no-such-agent-binary", None, Sandbox::None);
        assert!(matches!(
            agent.preflight().await,
            Err(SetupError::AgentNotFound { binary }) if binary == "ralph-no-such-agent-binary"
        ));
    }

    #[tokio::test]
    async fn invoke_streams_agent_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = write_script(
            temp.path(),
            "fake-claude",
            "echo \"args: $1 $2\"; echo \"cwd: $(pwd)\"; echo boom >&2",
        );
        let agent = ClaudeAgent::new(script.display().to_string(), None, Sandbox::None);
        agent.preflight().await.expect("preflight");
        let log_path = temp.path().join("iteration-1.md");
        let sink = LineSink::create(&log_path, false).expect("sink");
        let token = CancellationToken::new();

        agent
            .invoke(InvokeRequest {
                workdir: temp.path(),
                prompt: "hello",
                sink: &sink,
                cancel: &token,
            })
            .await
            .expect("invoke");

        let log = std::fs::read_to_string(&log_path).expect("read");
        assert!(log.contains("args: --print --dangerously-skip-permissions"));
        assert!(log.contains("[ERR] boom"));
    }

    #[tokio::test]
    async fn invoke_maps_failure_exit_code() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = write_script(temp.path(), "fake-claude", "exit 4");
        let agent = ClaudeAgent::new(script.display().to_string(), None, Sandbox::None);
        let sink = LineSink::create(&temp.path().join("log.md"), false).expect("sink");
        let token = CancellationToken::new();

        let err = agent
            .invoke(InvokeRequest {
                workdir: temp.path(),
                prompt: "hello",
                sink: &sink,
                cancel: &token,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Exited { code: Some(4) }));
    }

    #[tokio::test]
    async fn invoke_refuses_when_already_cancelled() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = write_script(temp.path(), "fake-claude", "touch ran");
        let agent = ClaudeAgent::new(script.display().to_string(), None, Sandbox::None);
        let sink = LineSink::create(&temp.path().join("log.md"), false).expect("sink");
        let token = CancellationToken::new();
        token.cancel();

        let err = agent
            .invoke(InvokeRequest {
                workdir: temp.path(),
                prompt: "hello",
                sink: &sink,
                cancel: &token,
            })
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(!temp.path().join("ran").exists());
    }

    #[tokio::test]
    async fn docker_check_follows_exit_status() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ok = write_script(temp.path(), "docker-ok", "exit 0");
        let missing = write_script(temp.path(), "docker-old", "echo 'unknown command' >&2; exit 1");

        assert!(docker_sandbox_available(&ok, Duration::from_secs(5)).await);
        assert!(!docker_sandbox_available(&missing, Duration::from_secs(5)).await);
    }

    /// A hung docker must not stall other tasks on a single-threaded runtime.
    #[tokio::test(flavor = "current_thread")]
    async fn docker_check_times_out_without_blocking() {
        let temp = tempfile::tempdir().expect("tempdir");
        let hung = write_script(temp.path(), "docker-hung", "exec sleep 30");

        let started = std::time::Instant::now();
        let ticker = tokio::spawn(async {
            for _ in 0..5 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            std::time::Instant::now()
        });
        let available = docker_sandbox_available(&hung, Duration::from_millis(300)).await;
        let checked_at = std::time::Instant::now();
        let ticked_at = ticker.await.expect("ticker");

        assert!(!available);
        assert!(ticked_at < checked_at);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
