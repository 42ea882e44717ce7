//! Run registry: `<config_dir>/loops.json`, shared by every ralph process.
//!
//! Every operation loads the whole file, mutates it in memory and writes it
//! back. There is no locking; concurrent writers race and the last rename wins.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::core::session::SessionRecord;
use crate::io::atomic::write_atomic;
use crate::io::config::config_dir;

/// On-disk shape: `{"loops": {"<name>": {...}}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    loops: BTreeMap<String, SessionRecord>,
}

/// Handle to a registry file. Cheap to clone; holds no open file.
#[derive(Debug, Clone)]
pub struct Registry {
    path: PathBuf,
}

impl Registry {
    /// Registry stored in `dir/loops.json`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join("loops.json"),
        }
    }

    /// Registry in the global config directory.
    pub fn open_default() -> Result<Self> {
        Ok(Self::in_dir(config_dir()?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, name: &str) -> Result<Option<SessionRecord>> {
        Ok(self.load()?.loops.remove(name))
    }

    /// Upsert the record under its own name.
    #[instrument(skip_all, fields(name = %record.name, status = record.status.as_str(), pid = record.pid))]
    pub fn set(&self, record: &SessionRecord) -> Result<()> {
        let mut file = self.load()?;
        file.loops.insert(record.name.clone(), record.clone());
        self.save(&file)
    }

    /// Remove a record. Returns the removed record, if any.
    pub fn remove(&self, name: &str) -> Result<Option<SessionRecord>> {
        let mut file = self.load()?;
        let removed = file.loops.remove(name);
        if removed.is_some() {
            self.save(&file)?;
        }
        Ok(removed)
    }

    /// Every record, in name order.
    pub fn list_all(&self) -> Result<Vec<SessionRecord>> {
        Ok(self.load()?.loops.into_values().collect())
    }

    fn load(&self) -> Result<RegistryFile> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(RegistryFile::default()),
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", self.path.display()));
            }
        };
        if contents.trim().is_empty() {
            return Ok(RegistryFile::default());
        }
        serde_json::from_str(&contents)
            .with_context(|| format!("parse registry {}", self.path.display()))
    }

    fn save(&self, file: &RegistryFile) -> Result<()> {
        debug!(path = %self.path.display(), records = file.loops.len(), "writing registry");
        let mut buf = serde_json::to_string_pretty(file).context("serialize registry")?;
        buf.push('\n');
        write_atomic(&self.path, &buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::{LifecycleStatus, now};

    #[test]
    fn missing_file_is_empty_registry() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = Registry::in_dir(temp.path());
        assert!(registry.list_all().expect("list").is_empty());
        assert!(registry.get("nope").expect("get").is_none());
    }

    #[test]
    fn set_get_remove_cycle() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = Registry::in_dir(temp.path().join("ralph"));
        let mut record = SessionRecord::new("shop-auth", "/code/shop-auth");
        registry.set(&record).expect("set");

        record.mark_running(77, now());
        registry.set(&record).expect("upsert");
        let loaded = registry.get("shop-auth").expect("get").expect("present");
        assert_eq!(loaded.status, LifecycleStatus::Running);
        assert_eq!(loaded.pid, 77);

        assert!(registry.remove("shop-auth").expect("remove").is_some());
        assert!(registry.remove("shop-auth").expect("remove again").is_none());
        assert!(registry.list_all().expect("list").is_empty());
    }

    #[test]
    fn list_all_is_name_ordered() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = Registry::in_dir(temp.path());
        for name in ["zeta", "alpha", "mid"] {
            registry
                .set(&SessionRecord::new(name, format!("/code/{name}")))
                .expect("set");
        }
        let names: Vec<String> = registry
            .list_all()
            .expect("list")
            .into_iter()
            .map(|record| record.name)
            .collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn file_uses_loops_envelope_and_omits_zero_pid() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = Registry::in_dir(temp.path());
        registry
            .set(&SessionRecord::new("shop", "/code/shop"))
            .expect("set");

        let raw = fs::read_to_string(registry.path()).expect("read");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("json");
        let record = &value["loops"]["shop"];
        assert_eq!(record["name"], "shop");
        assert_eq!(record["status"], "created");
        assert!(record.get("pid").is_none());
    }

    #[test]
    fn reads_records_written_by_older_tools() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = Registry::in_dir(temp.path());
        fs::write(
            registry.path(),
            r#"{"loops":{"legacy":{"name":"legacy","path":"/x","project":"","feature":"","branch":"","status":"stopped"}}}"#,
        )
        .expect("write");
        let record = registry.get("legacy").expect("get").expect("present");
        assert_eq!(record.status, LifecycleStatus::Stopped);
        assert_eq!(record.pid, 0);
    }
}
