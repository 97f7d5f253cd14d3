use crate::context::RuntimeContext;
use crate::events::{EventLog, InMemoryEventLog};
use crate::storage::{InMemorySnapshotStore, JsonlEventLog, RedbSnapshotStore, SnapshotStore};
use crate::workflow::WorkflowEngine;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Engine configuration, usually read from `runloom.toml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub events: EventsConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Memory,
    Redb,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    #[serde(default = "default_snapshot_path")]
    pub path: PathBuf,
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("data/snapshots.redb")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_snapshot_path(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventsBackend {
    #[default]
    None,
    Memory,
    Jsonl,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default)]
    pub backend: EventsBackend,

    #[serde(default = "default_event_dir")]
    pub dir: PathBuf,
}

fn default_event_dir() -> PathBuf {
    PathBuf::from("data/events")
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            backend: EventsBackend::default(),
            dir: default_event_dir(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Upper bound on concurrently running branches of one parallel group
    #[serde(default)]
    pub max_parallel_branches: Option<usize>,

    /// Cancel a run's execution after this many seconds
    #[serde(default)]
    pub run_timeout_secs: Option<u64>,
}

impl ExecutionConfig {
    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directives; `RUST_LOG` takes precedence when set
    #[serde(default = "default_log_filter")]
    pub filter: String,

    #[serde(default)]
    pub json: bool,
}

fn default_log_filter() -> String {
    "runloom_core=info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `path`, falling back to defaults if the file is absent
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(
                "Configuration file {} not found, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(path).context("Failed to read configuration file")?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse configuration file")?;
        if config.execution.max_parallel_branches == Some(0) {
            anyhow::bail!("execution.max_parallel_branches must be at least 1");
        }
        Ok(config)
    }

    pub fn open_store(&self) -> Result<Arc<dyn SnapshotStore>> {
        let store: Arc<dyn SnapshotStore> = match self.storage.backend {
            StorageBackend::Memory => Arc::new(InMemorySnapshotStore::new()),
            StorageBackend::Redb => Arc::new(
                RedbSnapshotStore::new(self.storage.path.clone())
                    .context("Failed to open snapshot store")?,
            ),
        };
        Ok(store)
    }

    pub fn open_event_log(&self) -> Result<Option<Arc<dyn EventLog>>> {
        let log: Arc<dyn EventLog> = match self.events.backend {
            EventsBackend::None => return Ok(None),
            EventsBackend::Memory => Arc::new(InMemoryEventLog::new()),
            EventsBackend::Jsonl => Arc::new(
                JsonlEventLog::new(self.events.dir.clone())
                    .context("Failed to create event log")?,
            ),
        };
        Ok(Some(log))
    }

    /// Wire a [`WorkflowEngine`] from this configuration
    pub fn build_engine(&self, context: RuntimeContext) -> Result<WorkflowEngine> {
        let mut builder = WorkflowEngine::builder(self.open_store()?)
            .runtime(context)
            .execution(self.execution.clone());
        if let Some(log) = self.open_event_log()? {
            builder = builder.event_log(log);
        }
        Ok(builder.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = EngineConfig::load(&temp_dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.events.backend, EventsBackend::None);
    }

    #[test]
    fn test_parse_full_config() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("runloom.toml");
        std::fs::write(
            &path,
            r#"
[storage]
backend = "redb"
path = "/var/lib/runloom/snapshots.redb"

[events]
backend = "jsonl"
dir = "/var/lib/runloom/events"

[execution]
max_parallel_branches = 4
run_timeout_secs = 600

[logging]
filter = "runloom_core=debug"
json = true
"#,
        )
        .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.storage.backend, StorageBackend::Redb);
        assert_eq!(config.events.backend, EventsBackend::Jsonl);
        assert_eq!(config.execution.max_parallel_branches, Some(4));
        assert_eq!(config.execution.run_timeout(), Some(Duration::from_secs(600)));
        assert!(config.logging.json);
    }

    #[test]
    fn test_rejects_bad_config() {
        assert!(EngineConfig::from_toml_str("[storage]\nbackend = \"postgres\"").is_err());
        assert!(EngineConfig::from_toml_str("[execution]\nmax_parallel_branches = 0").is_err());
    }

    #[tokio::test]
    async fn test_build_engine_with_redb_store() {
        let temp_dir = TempDir::new().unwrap();
        let config = EngineConfig {
            storage: StorageConfig {
                backend: StorageBackend::Redb,
                path: temp_dir.path().join("snapshots.redb"),
            },
            events: EventsConfig {
                backend: EventsBackend::Jsonl,
                dir: temp_dir.path().join("events"),
            },
            ..Default::default()
        };

        let engine = config.build_engine(RuntimeContext::new()).unwrap();
        assert!(engine.has_event_log());
        assert!(temp_dir.path().join("snapshots.redb").exists());
    }
}
