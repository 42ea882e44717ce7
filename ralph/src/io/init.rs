//! Project layout and `ralph init` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::errors::SetupError;
use crate::io::config::{ProjectConfig, write_project_config};

const GITIGNORE_MARKER: &str = ".ralph/";
const GITIGNORE_ENTRY: &str = "\n# Ralph tooling\n.ralph/\nprd.json\n";
/// Seed for the agent's running notes; the prompts ask it to append here.
const PROGRESS_HEADER: &str = "# Progress log\n";

/// All canonical paths for a project root.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub ralph_dir: PathBuf,
    pub config_path: PathBuf,
    pub backlog_path: PathBuf,
    pub progress_path: PathBuf,
    pub session_log_path: PathBuf,
    pub conversations_dir: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let ralph_dir = root.join(".ralph");
        Self {
            root: root.clone(),
            config_path: root.join("ralph.toml"),
            backlog_path: ralph_dir.join("prd.json"),
            progress_path: ralph_dir.join("progress.txt"),
            session_log_path: ralph_dir.join("session.log"),
            conversations_dir: ralph_dir.join("conversations"),
            ralph_dir,
        }
    }

    /// `.ralph/conversations/iteration-<n>.md`
    pub fn conversation_path(&self, iteration: u32) -> PathBuf {
        self.conversations_dir
            .join(format!("iteration-{iteration}.md"))
    }
}

/// Nearest ancestor of `start` (inclusive) holding `ralph.toml` or `.ralph/`.
pub fn find_project_root(start: &Path) -> Result<PathBuf, SetupError> {
    for dir in start.ancestors() {
        if dir.join("ralph.toml").is_file() || dir.join(".ralph").is_dir() {
            debug!(root = %dir.display(), "found project root");
            return Ok(dir.to_path_buf());
        }
    }
    Err(SetupError::NotInProject {
        start: start.to_path_buf(),
    })
}

/// What `init_project` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitOutcome {
    Initialized { project: String },
    AlreadyInitialized,
}

/// Create `ralph.toml`, `.ralph/progress.txt`, and a `.gitignore` entry for
/// ralph artifacts.
///
/// Existing `ralph.toml` files are left untouched.
pub fn init_project(root: &Path) -> Result<InitOutcome> {
    let paths = ProjectPaths::new(root);
    if paths.config_path.exists() {
        info!(path = %paths.config_path.display(), "project already initialized");
        return Ok(InitOutcome::AlreadyInitialized);
    }

    let project = crate::core::session::session_name(root);
    write_project_config(&paths.config_path, &ProjectConfig::for_project(&project))?;
    fs::create_dir_all(&paths.ralph_dir)
        .with_context(|| format!("create {}", paths.ralph_dir.display()))?;
    if !paths.progress_path.exists() {
        fs::write(&paths.progress_path, PROGRESS_HEADER)
            .with_context(|| format!("write {}", paths.progress_path.display()))?;
    }
    ensure_gitignore(root)?;

    info!(project = %project, root = %root.display(), "initialized project");
    Ok(InitOutcome::Initialized { project })
}

fn ensure_gitignore(root: &Path) -> Result<()> {
    let path = root.join(".gitignore");
    let existing = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    if existing.contains(GITIGNORE_MARKER) {
        return Ok(());
    }
    let mut updated = existing;
    updated.push_str(GITIGNORE_ENTRY);
    fs::write(&path, updated).with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_paths_are_stable() {
        let paths = ProjectPaths::new("/code/shop");
        assert!(paths.backlog_path.ends_with(".ralph/prd.json"));
        assert!(paths.session_log_path.ends_with(".ralph/session.log"));
        assert!(
            paths
                .conversation_path(3)
                .ends_with(".ralph/conversations/iteration-3.md")
        );
    }

    #[test]
    fn finds_root_from_nested_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join(".ralph")).expect("mkdir");
        let nested = temp.path().join("src/deep");
        fs::create_dir_all(&nested).expect("mkdir nested");

        let root = find_project_root(&nested).expect("root");
        assert_eq!(root, temp.path());
    }

    #[test]
    fn missing_markers_is_not_in_project() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = find_project_root(temp.path()).unwrap_err();
        assert!(matches!(err, SetupError::NotInProject { .. }));
    }

    #[test]
    fn init_creates_layout_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("shop");
        fs::create_dir_all(&root).expect("mkdir");

        let outcome = init_project(&root).expect("init");
        assert_eq!(
            outcome,
            InitOutcome::Initialized {
                project: "shop".to_string()
            }
        );
        assert!(root.join("ralph.toml").is_file());
        assert!(root.join(".ralph").is_dir());
        assert_eq!(
            fs::read_to_string(root.join(".ralph/progress.txt")).expect("progress"),
            PROGRESS_HEADER
        );
        let gitignore = fs::read_to_string(root.join(".gitignore")).expect("gitignore");
        assert!(gitignore.contains(".ralph/"));

        assert_eq!(
            init_project(&root).expect("init again"),
            InitOutcome::AlreadyInitialized
        );
        let again = fs::read_to_string(root.join(".gitignore")).expect("gitignore");
        assert_eq!(again.matches(".ralph/").count(), 1);
    }
}
