//! Backlog persistence at `.ralph/prd.json`.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::backlog::Backlog;
use crate::errors::BacklogError;
use crate::io::atomic::write_atomic;
use crate::io::init::ProjectPaths;

/// Load the backlog for a project root.
///
/// Returns `Ok(None)` when the file does not exist; a malformed file is a
/// [`BacklogError::Parse`].
pub fn load_backlog(root: &Path) -> Result<Option<Backlog>> {
    load_backlog_file(&ProjectPaths::new(root).backlog_path)
}

pub fn load_backlog_file(path: &Path) -> Result<Option<Backlog>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "no backlog");
            return Ok(None);
        }
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let backlog: Backlog =
        serde_json::from_str(&contents).map_err(|source| BacklogError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    debug!(path = %path.display(), progress = %backlog.progress_label(), "backlog loaded");
    Ok(Some(backlog))
}

/// Write the backlog, creating `.ralph/` if needed.
pub fn save_backlog(root: &Path, backlog: &Backlog) -> Result<()> {
    let path = ProjectPaths::new(root).backlog_path;
    debug!(path = %path.display(), items = backlog.items.len(), "writing backlog");
    let mut buf = serde_json::to_string_pretty(backlog).context("serialize backlog")?;
    buf.push('\n');
    write_atomic(&path, &buf)
}
