//! Configuration: global `config.toml`, project `ralph.toml`, CLI overrides.
//!
//! Both files are meant to be edited by humans. Every field is optional and a
//! missing file behaves like an empty one.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::{InvocationMode, Sandbox};
use crate::io::atomic::write_atomic;

/// Environment variable overriding the global config directory.
pub const CONFIG_DIR_ENV: &str = "RALPH_CONFIG_DIR";

pub const DEFAULT_MAX_ITERATIONS: u32 = 10;
pub const DEFAULT_PAUSE_SECS: u64 = 5;
pub const DEFAULT_AGENT_BINARY: &str = "claude";

/// `<config_dir>/config.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GlobalConfig {
    pub defaults: DefaultsConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DefaultsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
}

/// `<root>/ralph.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProjectConfig {
    pub project: ProjectSection,
    pub agent: AgentSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProjectSection {
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    /// Agent executable looked up on `PATH`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<InvocationMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<Sandbox>,
    /// Seconds to wait between iterations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_secs: Option<u64>,
}

impl ProjectConfig {
    /// Starter config written by `ralph init`.
    pub fn for_project(name: &str) -> Self {
        Self {
            project: ProjectSection {
                name: name.to_string(),
            },
            agent: AgentSection {
                max_iterations: Some(DEFAULT_MAX_ITERATIONS),
                ..AgentSection::default()
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.max_iterations == Some(0) {
            return Err(anyhow!("agent.max_iterations must be > 0"));
        }
        if self
            .agent
            .binary
            .as_deref()
            .is_some_and(|binary| binary.trim().is_empty())
        {
            return Err(anyhow!("agent.binary must not be empty"));
        }
        Ok(())
    }
}

impl GlobalConfig {
    pub fn validate(&self) -> Result<()> {
        if self.defaults.max_iterations == Some(0) {
            return Err(anyhow!("defaults.max_iterations must be > 0"));
        }
        Ok(())
    }
}

/// Per-invocation overrides from CLI flags. `None` defers to config files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOverrides {
    pub max_iterations: Option<u32>,
    pub once: bool,
    pub mode: Option<InvocationMode>,
    pub sandbox: Option<Sandbox>,
    pub model: Option<String>,
}

/// Fully resolved settings for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSettings {
    pub model: Option<String>,
    pub max_iterations: u32,
    pub once: bool,
    pub binary: String,
    pub mode: InvocationMode,
    pub sandbox: Sandbox,
    pub pause: Duration,
    /// Mirror agent output to the terminal.
    pub echo: bool,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            model: None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            once: false,
            binary: DEFAULT_AGENT_BINARY.to_string(),
            mode: InvocationMode::default(),
            sandbox: Sandbox::default(),
            pause: Duration::from_secs(DEFAULT_PAUSE_SECS),
            echo: true,
        }
    }
}

impl RunSettings {
    /// Merge CLI > project > global > built-in defaults.
    ///
    /// `once` forces a single iteration regardless of any configured cap.
    pub fn resolve(global: &GlobalConfig, project: &ProjectConfig, overrides: &RunOverrides) -> Self {
        let defaults = Self::default();
        let agent = &project.agent;
        let max_iterations = if overrides.once {
            1
        } else {
            overrides
                .max_iterations
                .or(agent.max_iterations)
                .or(global.defaults.max_iterations)
                .unwrap_or(defaults.max_iterations)
        };
        Self {
            model: overrides
                .model
                .clone()
                .or_else(|| agent.model.clone())
                .or_else(|| global.defaults.model.clone()),
            max_iterations,
            once: overrides.once,
            binary: agent.binary.clone().unwrap_or(defaults.binary),
            mode: overrides.mode.or(agent.mode).unwrap_or(defaults.mode),
            sandbox: overrides
                .sandbox
                .or(agent.sandbox)
                .unwrap_or(defaults.sandbox),
            pause: agent
                .pause_secs
                .map_or(defaults.pause, Duration::from_secs),
            echo: defaults.echo,
        }
    }

    /// Iterations the loop may run. `once` wins over any cap.
    pub fn iteration_cap(&self) -> u32 {
        if self.once { 1 } else { self.max_iterations }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max iterations must be > 0"));
        }
        if self.binary.trim().is_empty() {
            return Err(anyhow!("agent binary must not be empty"));
        }
        Ok(())
    }
}

/// Global config directory: `$RALPH_CONFIG_DIR`, else `~/.config/ralph`.
pub fn config_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV).filter(|dir| !dir.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    let home = dirs::home_dir().context("cannot determine home directory")?;
    Ok(home.join(".config").join("ralph"))
}

pub fn global_config_path(config_dir: &Path) -> PathBuf {
    config_dir.join("config.toml")
}

/// Load the global config. A missing file yields defaults.
pub fn load_global_config(path: &Path) -> Result<GlobalConfig> {
    let cfg: GlobalConfig = load_toml_or_default(path)?;
    cfg.validate()
        .with_context(|| format!("invalid {}", path.display()))?;
    Ok(cfg)
}

/// Load `ralph.toml`. A missing file yields defaults.
pub fn load_project_config(path: &Path) -> Result<ProjectConfig> {
    let cfg: ProjectConfig = load_toml_or_default(path)?;
    cfg.validate()
        .with_context(|| format!("invalid {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write `ralph.toml` (temp file + rename).
pub fn write_project_config(path: &Path, cfg: &ProjectConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = format!("# ralph configuration for {}\n\n", cfg.project.name);
    buf.push_str(&toml::to_string_pretty(cfg).context("serialize config toml")?);
    write_atomic(path, &buf)
}

fn load_toml_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        debug!(path = %path.display(), "config missing, using defaults");
        return Ok(T::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}
