//! Result publishing once the backlog is complete: commit, push, open a PR.
//!
//! Every step is best-effort. Failures become warnings on the
//! [`PublishReport`]; publishing never fails the run.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tracing::{info, instrument, warn};

use crate::core::backlog::Backlog;
use crate::io::agent::resolve_on_path;
use crate::io::git::Git;
use crate::io::process::run_command_with_timeout;

/// Per-command timeout for `git` and `gh`.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const PROTECTED_BRANCHES: &[&str] = &["main", "master"];

/// Which publishing steps went through.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub branch: Option<String>,
    pub committed: bool,
    pub pushed: bool,
    pub pr_created: bool,
    pub warnings: Vec<String>,
}

impl PublishReport {
    fn warn(&mut self, message: String) {
        warn!(%message, "publish step failed");
        self.warnings.push(message);
    }
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish a completed backlog from `root`. Never fails; see the report.
    async fn publish(&self, root: &Path, backlog: &Backlog) -> PublishReport;
}

/// Publishes through `git` and the GitHub CLI.
#[derive(Debug, Clone)]
pub struct GhPublisher {
    pub step_timeout: Duration,
}

impl Default for GhPublisher {
    fn default() -> Self {
        Self {
            step_timeout: DEFAULT_STEP_TIMEOUT,
        }
    }
}

#[async_trait]
impl Publisher for GhPublisher {
    async fn publish(&self, root: &Path, backlog: &Backlog) -> PublishReport {
        let root = root.to_path_buf();
        let backlog = backlog.clone();
        let timeout = self.step_timeout;
        match tokio::task::spawn_blocking(move || publish_blocking(&root, &backlog, timeout)).await
        {
            Ok(report) => report,
            Err(err) => {
                let mut report = PublishReport::default();
                report.warn(format!("publisher task failed: {err}"));
                report
            }
        }
    }
}

/// The synchronous publishing sequence.
#[instrument(skip_all, fields(root = %root.display(), name = %backlog.name))]
pub fn publish_blocking(root: &Path, backlog: &Backlog, timeout: Duration) -> PublishReport {
    let mut report = PublishReport::default();
    let git = Git::new(root, timeout);

    let branch = match git.current_branch() {
        Ok(branch) => branch,
        Err(err) => {
            report.warn(format!("failed to get branch: {err:#}"));
            return report;
        }
    };
    report.branch = Some(branch.clone());
    if PROTECTED_BRANCHES.contains(&branch.as_str()) {
        report.warn(format!("cannot create PR from {branch} branch"));
        return report;
    }

    match commit_outstanding(&git, &backlog.name) {
        Ok(committed) => report.committed = committed,
        Err(err) => report.warn(format!("failed to commit changes: {err:#}")),
    }

    info!(branch = %branch, "pushing branch");
    if let Err(err) = git.push_upstream(&branch) {
        report.warn(format!("failed to push: {err:#}"));
        return report;
    }
    report.pushed = true;

    let Some(gh) = resolve_on_path("gh") else {
        report.warn("gh CLI not found - install from https://cli.github.com".to_string());
        return report;
    };
    match create_pull_request(&gh, root, backlog, timeout) {
        Ok(()) => {
            info!("pull request created");
            report.pr_created = true;
        }
        Err(err) => report.warn(format!("failed to create PR: {err:#}")),
    }
    report
}

fn commit_outstanding(git: &Git, name: &str) -> Result<bool> {
    let changes = git.status_porcelain()?;
    if changes.is_empty() {
        return Ok(false);
    }
    info!(changed = changes.len(), "committing outstanding changes");
    git.stage_for_publish()?;
    git.commit_staged(&format!("feat: complete {name}"))
}

fn create_pull_request(
    gh: &Path,
    root: &Path,
    backlog: &Backlog,
    timeout: Duration,
) -> Result<()> {
    let mut cmd = Command::new(gh);
    cmd.args(["pr", "create", "--title", &backlog.name, "--body", &pr_body(backlog)])
        .current_dir(root);
    let output = run_command_with_timeout(cmd, timeout, 64 * 1024)?;
    if output.timed_out {
        return Err(anyhow!("gh pr create timed out after {}s", timeout.as_secs()));
    }
    if !output.status.success() {
        return Err(anyhow!("gh pr create failed: {}", output.stderr_text()));
    }
    let url = output.stdout_text();
    if !url.is_empty() {
        info!(url = %url, "pull request url");
    }
    Ok(())
}

/// Markdown body for the pull request.
pub fn pr_body(backlog: &Backlog) -> String {
    let mut body = format!("## {}\n\n", backlog.name);
    if !backlog.description.is_empty() {
        body.push_str(&backlog.description);
        body.push_str("\n\n");
    }
    body.push_str("## Stories completed\n");
    for item in &backlog.items {
        body.push_str(&format!("- ✅ {}\n", item.title));
    }
    body.push_str("\n_Generated by ralph_ 🤖");
    body
}
