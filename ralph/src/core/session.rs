//! Session records: the per-run metadata kept in the shared registry.

use std::path::Path;

use chrono::{DateTime, FixedOffset, Local, SubsecRound};
use serde::{Deserialize, Deserializer, Serialize};

/// Wall-clock timestamp stored in the registry (RFC 3339, second precision).
pub type Timestamp = DateTime<FixedOffset>;

/// Current local time truncated to whole seconds.
pub fn now() -> Timestamp {
    Local::now().fixed_offset().trunc_subsecs(0)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleStatus {
    #[default]
    Created,
    Running,
    Stopped,
}

impl LifecycleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

/// One named session tied to a filesystem root.
///
/// `pid` is non-zero exactly when `status` is `Running`; the transition
/// methods below are the only writers of either field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub feature: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub status: LifecycleStatus,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub pid: u32,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "optional_timestamp"
    )]
    pub created: Option<Timestamp>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "optional_timestamp"
    )]
    pub started: Option<Timestamp>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "optional_timestamp"
    )]
    pub stopped: Option<Timestamp>,
}

impl SessionRecord {
    /// Fresh record in the `created` state.
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            project: String::new(),
            feature: String::new(),
            branch: String::new(),
            status: LifecycleStatus::Created,
            pid: 0,
            created: Some(now()),
            started: None,
            stopped: None,
        }
    }

    /// Record for a project root, named after the root directory.
    pub fn for_root(root: &Path) -> Self {
        Self::new(session_name(root), root.display().to_string())
    }

    /// True when the registry claims this session is running.
    ///
    /// This is the recorded state only; see `io::supervisor::is_running` for
    /// a liveness check of the recorded pid.
    pub fn is_marked_running(&self) -> bool {
        self.status == LifecycleStatus::Running
    }

    /// `created | stopped -> running`. Returns false (and changes nothing)
    /// when the record is already running.
    pub fn mark_running(&mut self, pid: u32, at: Timestamp) -> bool {
        if self.is_marked_running() || pid == 0 {
            return false;
        }
        self.status = LifecycleStatus::Running;
        self.pid = pid;
        self.started = Some(at);
        true
    }

    /// Any state -> `stopped` with the pid cleared.
    pub fn mark_stopped(&mut self, at: Timestamp) {
        self.status = LifecycleStatus::Stopped;
        self.pid = 0;
        self.stopped = Some(at);
    }
}

/// Registry key for a project root: its final path component.
pub fn session_name(root: &Path) -> String {
    root.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| root.display().to_string())
}

fn is_zero(pid: &u32) -> bool {
    *pid == 0
}

/// Accepts a missing field, `null`, or `""` as "no timestamp".
fn optional_timestamp<'de, D>(deserializer: D) -> Result<Option<Timestamp>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => DateTime::parse_from_rfc3339(value)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}
