//! Test-only doubles: a scripted agent, a recording publisher, and a
//! throwaway project with its own registry.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tempfile::TempDir;

use crate::core::backlog::{Backlog, Item};
use crate::core::session::SessionRecord;
use crate::errors::{InvokeError, SetupError};
use crate::io::agent::{Agent, InvokeRequest};
use crate::io::backlog_store::{load_backlog, save_backlog};
use crate::io::process::StreamKind;
use crate::io::publisher::{PublishReport, Publisher};
use crate::io::registry::Registry;

/// What the scripted agent does on one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedStep {
    /// Mark the given item ids as passing and exit successfully.
    Pass(Vec<String>),
    /// Exit successfully without touching the backlog.
    Noop,
    /// Exit with the given status code.
    Fail(i32),
    /// Block until the run is cancelled.
    WaitForCancel,
}

impl ScriptedStep {
    pub fn pass(id: &str) -> Self {
        Self::Pass(vec![id.to_string()])
    }

    pub fn noop() -> Self {
        Self::Noop
    }

    pub fn fail(code: i32) -> Self {
        Self::Fail(code)
    }
}

/// Agent that replays [`ScriptedStep`]s in order; `Noop` once exhausted.
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    steps: Mutex<VecDeque<ScriptedStep>>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicU32,
    missing_binary: Option<String>,
}

impl ScriptedAgent {
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            ..Self::default()
        }
    }

    /// Agent whose preflight fails as if `binary` were not installed.
    pub fn unavailable(binary: &str) -> Self {
        Self {
            missing_binary: Some(binary.to_string()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Prompts received so far, oldest first.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompts lock").clone()
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn preflight(&self) -> Result<(), SetupError> {
        match &self.missing_binary {
            Some(binary) => Err(SetupError::AgentNotFound {
                binary: binary.clone(),
            }),
            None => Ok(()),
        }
    }

    async fn invoke(&self, request: InvokeRequest<'_>) -> Result<(), InvokeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .expect("prompts lock")
            .push(request.prompt.to_string());
        let step = self
            .steps
            .lock()
            .expect("steps lock")
            .pop_front()
            .unwrap_or(ScriptedStep::Noop);

        match step {
            ScriptedStep::Pass(ids) => {
                let mut backlog = load_backlog(request.workdir)?
                    .ok_or_else(|| anyhow::anyhow!("scripted agent found no backlog"))?;
                for id in &ids {
                    backlog.mark_passed(id);
                }
                save_backlog(request.workdir, &backlog)?;
                request
                    .sink
                    .write_line(StreamKind::Stdout, format!("passed {}\n", ids.join(",")).as_bytes())?;
                Ok(())
            }
            ScriptedStep::Noop => {
                request.sink.write_line(StreamKind::Stdout, b"nothing to do\n")?;
                Ok(())
            }
            ScriptedStep::Fail(code) => {
                request.sink.write_line(StreamKind::Stderr, b"scripted failure\n")?;
                Err(InvokeError::Exited { code: Some(code) })
            }
            ScriptedStep::WaitForCancel => {
                request.sink.write_line(StreamKind::Stdout, b"working\n")?;
                request.cancel.cancelled().await;
                request.sink.write_line(StreamKind::Stdout, b"stopping\n")?;
                Err(InvokeError::Cancelled)
            }
        }
    }
}

/// Publisher that records calls instead of touching git.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    calls: AtomicU32,
    published: Mutex<Vec<Backlog>>,
}

impl RecordingPublisher {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<Backlog> {
        self.published.lock().expect("published lock").clone()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, _root: &Path, backlog: &Backlog) -> PublishReport {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.published
            .lock()
            .expect("published lock")
            .push(backlog.clone());
        PublishReport {
            branch: Some("feature/test".to_string()),
            committed: true,
            pushed: true,
            pr_created: true,
            warnings: Vec::new(),
        }
    }
}

/// A project root plus an isolated registry directory, both temporary.
///
/// The project directory is named `project`, so its session name is too.
pub struct TestProject {
    _temp: TempDir,
    root: PathBuf,
    registry: Registry,
}

impl TestProject {
    /// Project with `.ralph/` but no backlog.
    pub fn empty() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("project");
        fs::create_dir_all(root.join(".ralph")).expect("create .ralph");
        let registry = Registry::in_dir(temp.path().join("config"));
        Self {
            _temp: temp,
            root,
            registry,
        }
    }

    /// Project with a backlog of `(title, passes)` items, ids `1..=n`.
    pub fn with_items(items: &[(&str, bool)]) -> Self {
        let project = Self::empty();
        let mut backlog = Backlog::new("Test Feature", "Feature under test");
        for (title, passes) in items {
            backlog.append(Item {
                passes: *passes,
                acceptance_criteria: vec![format!("{title} works")],
                ..Item::new(*title)
            });
        }
        project.write_backlog(&backlog);
        project
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn name(&self) -> &str {
        "project"
    }

    pub fn record(&self) -> Option<SessionRecord> {
        self.registry.get(self.name()).expect("read registry")
    }

    pub fn set_record(&self, record: &SessionRecord) {
        self.registry.set(record).expect("write registry");
    }

    pub fn backlog(&self) -> Option<Backlog> {
        load_backlog(&self.root).expect("load backlog")
    }

    pub fn write_backlog(&self, backlog: &Backlog) {
        save_backlog(&self.root, backlog).expect("save backlog");
    }

    /// Read a file relative to the project root.
    pub fn read(&self, relative: &str) -> String {
        fs::read_to_string(self.root.join(relative))
            .unwrap_or_else(|err| panic!("read {relative}: {err}"))
    }
}
