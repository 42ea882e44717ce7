//! Shared enums for run configuration and loop outcomes.

use std::fmt;
use std::str::FromStr;

use anyhow::{Error, anyhow};
use serde::{Deserialize, Serialize};

/// How the agent is told what to work on. Chosen once per run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvocationMode {
    /// The loop picks the first incomplete item and asks the agent to
    /// implement exactly that item.
    PerItem,
    /// The agent receives the whole backlog and picks the highest-priority
    /// incomplete item itself.
    #[default]
    FullBacklog,
}

impl InvocationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PerItem => "per-item",
            Self::FullBacklog => "full-backlog",
        }
    }
}

impl FromStr for InvocationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "per-item" => Ok(Self::PerItem),
            "full-backlog" => Ok(Self::FullBacklog),
            other => Err(anyhow!(
                "invalid invocation mode: {other} (use: per-item, full-backlog)"
            )),
        }
    }
}

impl fmt::Display for InvocationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Isolation wrapper around the agent process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sandbox {
    /// Run the agent binary directly.
    #[default]
    None,
    /// `docker sandbox run <agent> . -- <args>`.
    Docker,
    /// macOS `sandbox-exec` with a permissive profile.
    Mac,
}

impl Sandbox {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Docker => "docker",
            Self::Mac => "mac",
        }
    }
}

impl FromStr for Sandbox {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "docker" => Ok(Self::Docker),
            "mac" => Ok(Self::Mac),
            other => Err(anyhow!("invalid sandbox mode: {other} (use: none, docker, mac)")),
        }
    }
}

impl fmt::Display for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal state of one run of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStop {
    /// The backlog is complete (or vanished); the publisher runs.
    Completed,
    /// Cancellation was observed.
    Interrupted,
    /// Every permitted iteration ran and items remain.
    IterationLimitReached,
}
