//! Engine configuration.
//!
//! Loaded from the embedded defaults, an optional TOML file, then
//! `TASKFLOW_*` environment variables (`__` between section and field).

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use taskflow_memory::MemoryConfig;
use taskflow_router::{ExternalToolConfig, RouterConfig};
use taskflow_session::SessionConfig;
use taskflow_workflow::WorkflowConfig;

/// Embedded default configuration.
pub const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub storage: StorageSettings,
    pub memory: MemorySettings,
    pub session: SessionSettings,
    pub workflow: WorkflowSettings,
    pub router: RouterConfig,
    pub external_tool: ExternalToolSettings,
    pub engine: EngineSettings,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    #[default]
    Fs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    /// Root directory for the `fs` backend.
    pub path: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Fs,
            path: PathBuf::from(".taskflow/memory"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySettings {
    pub autosave: bool,
    pub autosave_interval_secs: u64,
    pub max_memory_size: usize,
}

impl Default for MemorySettings {
    fn default() -> Self {
        let defaults = MemoryConfig::default();
        Self {
            autosave: defaults.autosave,
            autosave_interval_secs: defaults.autosave_interval.as_secs(),
            max_memory_size: defaults.max_memory_size,
        }
    }
}

impl From<&MemorySettings> for MemoryConfig {
    fn from(s: &MemorySettings) -> Self {
        Self {
            autosave: s.autosave,
            autosave_interval: Duration::from_secs(s.autosave_interval_secs.max(1)),
            max_memory_size: s.max_memory_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub max_sessions: usize,
    pub session_timeout_secs: u64,
    pub checkpoint_interval_secs: u64,
    pub max_checkpoints: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        let defaults = SessionConfig::default();
        Self {
            max_sessions: defaults.max_sessions,
            session_timeout_secs: defaults.session_timeout.as_secs(),
            checkpoint_interval_secs: defaults.checkpoint_interval.as_secs(),
            max_checkpoints: defaults.max_checkpoints,
        }
    }
}

impl From<&SessionSettings> for SessionConfig {
    fn from(s: &SessionSettings) -> Self {
        Self {
            max_sessions: s.max_sessions,
            session_timeout: Duration::from_secs(s.session_timeout_secs),
            checkpoint_interval: Duration::from_secs(s.checkpoint_interval_secs.max(1)),
            max_checkpoints: s.max_checkpoints,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSettings {
    pub max_concurrent_workflows: usize,
    pub step_timeout_secs: Option<u64>,
    pub working_dir: PathBuf,
    /// Directory of JSON workflow definitions loaded at startup.
    pub workflows_path: Option<PathBuf>,
    /// Seconds a finished workflow stays queryable.
    pub retention_secs: u64,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: 5,
            step_timeout_secs: Some(300),
            working_dir: PathBuf::from("."),
            workflows_path: None,
            retention_secs: 3600,
        }
    }
}

impl From<&WorkflowSettings> for WorkflowConfig {
    fn from(s: &WorkflowSettings) -> Self {
        Self {
            max_concurrent_workflows: s.max_concurrent_workflows,
            step_timeout: s.step_timeout_secs.map(Duration::from_secs),
            working_dir: s.working_dir.clone(),
            workflows_path: s.workflows_path.clone(),
            retention: Duration::from_secs(s.retention_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalToolSettings {
    pub enabled: bool,
    pub command: String,
    pub rules_path: Option<PathBuf>,
    pub working_dir: PathBuf,
    pub probe_timeout_secs: u64,
    pub call_timeout_secs: u64,
}

impl Default for ExternalToolSettings {
    fn default() -> Self {
        let defaults = ExternalToolConfig::default();
        Self {
            enabled: true,
            command: defaults.command,
            rules_path: defaults.rules_path,
            working_dir: defaults.working_dir,
            probe_timeout_secs: defaults.probe_timeout.as_secs(),
            call_timeout_secs: defaults.call_timeout.as_secs(),
        }
    }
}

impl From<&ExternalToolSettings> for ExternalToolConfig {
    fn from(s: &ExternalToolSettings) -> Self {
        Self {
            command: s.command.clone(),
            rules_path: s.rules_path.clone(),
            working_dir: s.working_dir.clone(),
            temp_dir: std::env::temp_dir(),
            probe_timeout: Duration::from_secs(s.probe_timeout_secs),
            call_timeout: Duration::from_secs(s.call_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Period of the `engine/state` save.
    pub state_save_interval_secs: u64,
    /// Events kept for late subscribers.
    pub event_history: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            state_save_interval_secs: 30,
            event_history: 256,
        }
    }
}

impl EngineConfig {
    /// Fully in-memory configuration with no external tool, for tests and
    /// embedding.
    #[must_use]
    pub fn ephemeral() -> Self {
        Self {
            storage: StorageSettings {
                backend: StorageBackend::Memory,
                ..StorageSettings::default()
            },
            external_tool: ExternalToolSettings {
                enabled: false,
                ..ExternalToolSettings::default()
            },
            ..Self::default()
        }
    }

    #[must_use]
    pub fn state_save_interval(&self) -> Duration {
        Duration::from_secs(self.engine.state_save_interval_secs.max(1))
    }
}

/// Load configuration from the defaults, `path` (if any) and the environment.
///
/// # Errors
/// Returns error if a source cannot be read or the result does not
/// deserialize.
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    load_with_env(
        path,
        Environment::with_prefix("TASKFLOW")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    )
}

fn load_with_env(path: Option<&Path>, env: Environment) -> Result<EngineConfig> {
    let mut builder =
        Config::builder().add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml));
    builder = match path {
        Some(path) => builder.add_source(File::from(path).required(true)),
        None => builder.add_source(File::with_name("taskflow").required(false)),
    };

    builder
        .add_source(env)
        .build()
        .context("Failed to build configuration")?
        .try_deserialize()
        .context("Failed to deserialize configuration")
}
