//! Git adapter for publishing finished work.
//!
//! A small, explicit wrapper around `git` subprocess calls; every call is
//! bounded by a timeout.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::io::process::{CommandOutput, run_command_with_timeout};

const OUTPUT_LIMIT_BYTES: usize = 256 * 1024;

/// Pathspecs staged on publish: everything except ralph's own artifacts.
pub const PUBLISH_PATHSPEC: &[&str] = &[
    ".",
    ":!.ralph/",
    ":!.ralph-tui/",
    ":!.rl/",
    ":!prd.json",
    ":!.ralph-*",
];

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    timeout: Duration,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            workdir: workdir.into(),
            timeout,
        }
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let name = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Changed and untracked entries, in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        // Untrimmed: the first column of the status code may be a space.
        let output = self.run_checked(&["status", "--porcelain"])?;
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_status_line)
            .collect()
    }

    /// Stage tracked modifications, then new files outside ralph's artifacts.
    #[instrument(skip_all)]
    pub fn stage_for_publish(&self) -> Result<()> {
        self.run_checked(&["add", "-u"])?;
        let mut args = vec!["add", "--all", "--"];
        args.extend_from_slice(PUBLISH_PATHSPEC);
        self.run_checked(&args)?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run_capture(&["diff", "--cached", "--name-only"])?;
        Ok(!out.is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    /// `git push -u origin <branch>`
    #[instrument(skip_all, fields(branch))]
    pub fn push_upstream(&self, branch: &str) -> Result<()> {
        self.run_checked(&["push", "-u", "origin", branch])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        Ok(self.run_checked(args)?.stdout_text())
    }

    fn run_checked(&self, args: &[&str]) -> Result<CommandOutput> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        let output = run_command_with_timeout(cmd, self.timeout, OUTPUT_LIMIT_BYTES)
            .map_err(|err| anyhow!("spawn git {}: {err:#}", args.join(" ")))?;
        if output.timed_out {
            return Err(anyhow!(
                "git {} timed out after {}s",
                args.join(" "),
                self.timeout.as_secs()
            ));
        }
        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                output.stderr_text()
            ));
        }
        Ok(output)
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    let (code, rest) = line
        .split_at_checked(2)
        .filter(|(_, rest)| rest.len() > 1)
        .ok_or_else(|| anyhow!("unexpected porcelain line: '{line}'"))?;
    let path = rest[1..].trim();
    let path = path.split_once(" -> ").map_or(path, |(_, new)| new.trim());
    Ok(StatusEntry {
        code: code.to_string(),
        path: path.to_string(),
    })
}
