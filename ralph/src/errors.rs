//! Typed errors for the places where callers branch on the failure kind.
//!
//! Everything else flows through `anyhow` with context attached at the I/O
//! boundary.

use std::path::PathBuf;

use thiserror::Error;

/// Failures that prevent a run from ever entering the running state.
///
/// The CLI maps these (and only these) to a failing exit code.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("not in a ralph project (no ralph.toml or .ralph/ above {})", start.display())]
    NotInProject { start: PathBuf },

    #[error("no backlog found at {}; create one with `ralph prd --new`", path.display())]
    NoBacklog { path: PathBuf },

    #[error("session {name} is already running (pid {pid}); stop it with `ralph stop {name}`")]
    AlreadyRunning { name: String, pid: u32 },

    #[error("agent binary `{binary}` not found on PATH")]
    AgentNotFound { binary: String },
}

/// Why a single agent invocation did not succeed.
#[derive(Debug, Error)]
pub enum InvokeError {
    /// The run was cancelled while the agent was running; output was drained.
    #[error("agent invocation cancelled")]
    Cancelled,

    #[error("agent exited with status {}", code.map_or_else(|| "signal".to_string(), |c| c.to_string()))]
    Exited { code: Option<i32> },

    #[error("failed to spawn agent `{binary}`: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    /// Reading the agent's output or writing the log sink failed.
    #[error("agent i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl InvokeError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Backlog file problems. A missing file is not an error.
#[derive(Debug, Error)]
pub enum BacklogError {
    #[error("failed to parse backlog {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
