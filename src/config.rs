//! Configuration
//!
//! `DataNodeConfig` is loaded from TOML; every section and field has a
//! default, so a partial file is enough. Environment variables override the
//! file:
//!
//! | Variable | Field |
//! |----------|-------|
//! | DATANODE_PARALLEL_TASK | sync.parallel_task |
//! | DATANODE_STORAGE_V2 | sync.storage_v2 |
//! | DATANODE_CP_UPDATE_INTERVAL_MS | tt_node.update_interval |
//! | DATANODE_STORE_TYPE | store.store_type (memory, localfs) |
//! | DATANODE_DATA_PATH | store.local_path |
//! | DATANODE_LOG_FORMAT | log.format (pretty, json) |
//! | DATANODE_LOG_FILTER | log.filter |

use crate::syncmgr::SyncTaskKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Error type for configuration loading
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataNodeConfig {
    pub sync: SyncManagerConfig,
    pub checkpoint: CheckpointUpdaterConfig,
    pub tt_node: TtNodeConfig,
    pub write_buffer: WriteBufferConfig,
    pub store: ChunkStoreConfig,
    pub log: LogConfig,
}

impl DataNodeConfig {
    /// Configuration for tests (in-memory store, fast intervals)
    pub fn test() -> Self {
        DataNodeConfig {
            sync: SyncManagerConfig::default(),
            checkpoint: CheckpointUpdaterConfig::test(),
            tt_node: TtNodeConfig::test(),
            write_buffer: WriteBufferConfig::test(),
            store: ChunkStoreConfig::default(),
            log: LogConfig::default(),
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: DataNodeConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Apply `DATANODE_*` environment overrides
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("DATANODE_PARALLEL_TASK") {
            self.sync.parallel_task = v
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("DATANODE_PARALLEL_TASK={}", v)))?;
        }
        if let Some(v) = lookup("DATANODE_STORAGE_V2") {
            self.sync.storage_v2 = v == "true" || v == "1";
        }
        if let Some(v) = lookup("DATANODE_CP_UPDATE_INTERVAL_MS") {
            let ms: u64 = v
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("DATANODE_CP_UPDATE_INTERVAL_MS={}", v)))?;
            self.tt_node.update_interval = Duration::from_millis(ms);
        }
        if let Some(v) = lookup("DATANODE_STORE_TYPE") {
            self.store.store_type = match v.to_lowercase().as_str() {
                "memory" | "inmemory" => ChunkStoreType::InMemory,
                "localfs" | "local" => ChunkStoreType::LocalFs,
                other => {
                    return Err(ConfigError::Invalid(format!("DATANODE_STORE_TYPE={}", other)));
                }
            };
        }
        if let Some(v) = lookup("DATANODE_DATA_PATH") {
            self.store.local_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("DATANODE_LOG_FORMAT") {
            self.log.format = match v.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                "pretty" | "text" => LogFormat::Pretty,
                other => {
                    return Err(ConfigError::Invalid(format!("DATANODE_LOG_FORMAT={}", other)));
                }
            };
        }
        if let Some(v) = lookup("DATANODE_LOG_FILTER") {
            self.log.filter = v;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.parallel_task < 1 {
            return Err(ConfigError::Invalid(format!(
                "sync.parallel_task must be positive, got {}",
                self.sync.parallel_task
            )));
        }
        let cp = &self.checkpoint;
        if cp.backoff_initial.is_zero() || cp.backoff_initial > cp.backoff_max {
            return Err(ConfigError::Invalid(format!(
                "checkpoint backoff range invalid: initial {:?}, max {:?}",
                cp.backoff_initial, cp.backoff_max
            )));
        }
        if cp.max_concurrent_publishes < 1 {
            return Err(ConfigError::Invalid(
                "checkpoint.max_concurrent_publishes must be positive".to_string(),
            ));
        }
        if cp.publish_timeout.is_zero() {
            return Err(ConfigError::Invalid("checkpoint.publish_timeout must be positive".to_string()));
        }
        if self.store.store_type == ChunkStoreType::LocalFs && self.store.local_path.is_none() {
            return Err(ConfigError::Invalid("store.local_path is required for localfs".to_string()));
        }
        Ok(())
    }
}

/// Sync manager settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncManagerConfig {
    /// Maximum number of sync tasks persisting at once (default: 6)
    pub parallel_task: usize,
    /// Build columnar sync tasks instead of per-field binlogs
    pub storage_v2: bool,
}

impl Default for SyncManagerConfig {
    fn default() -> Self {
        SyncManagerConfig {
            parallel_task: 6,
            storage_v2: false,
        }
    }
}

impl SyncManagerConfig {
    /// Task kind the write buffer builds
    pub fn task_kind(&self) -> SyncTaskKind {
        if self.storage_v2 {
            SyncTaskKind::Columnar
        } else {
            SyncTaskKind::Legacy
        }
    }
}

/// Checkpoint updater settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointUpdaterConfig {
    /// Timeout for a single publish call (default: 10s)
    #[serde(with = "duration_millis")]
    pub publish_timeout: Duration,
    /// First retry delay after a failed publish (default: 200ms)
    #[serde(with = "duration_millis")]
    pub backoff_initial: Duration,
    /// Upper bound for retry delay (default: 10s)
    #[serde(with = "duration_millis")]
    pub backoff_max: Duration,
    /// Channels published concurrently per round (default: 16)
    pub max_concurrent_publishes: usize,
}

impl Default for CheckpointUpdaterConfig {
    fn default() -> Self {
        CheckpointUpdaterConfig {
            publish_timeout: Duration::from_secs(10),
            backoff_initial: Duration::from_millis(200),
            backoff_max: Duration::from_secs(10),
            max_concurrent_publishes: 16,
        }
    }
}

impl CheckpointUpdaterConfig {
    /// Configuration for tests (fast retries)
    pub fn test() -> Self {
        CheckpointUpdaterConfig {
            publish_timeout: Duration::from_millis(500),
            backoff_initial: Duration::from_millis(5),
            backoff_max: Duration::from_millis(20),
            max_concurrent_publishes: 4,
        }
    }
}

/// Time-tick stage settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtNodeConfig {
    /// Minimum wall-clock gap between regular checkpoint updates (default: 60s)
    #[serde(with = "duration_millis")]
    pub update_interval: Duration,
}

impl Default for TtNodeConfig {
    fn default() -> Self {
        TtNodeConfig {
            update_interval: Duration::from_secs(60),
        }
    }
}

impl TtNodeConfig {
    pub fn test() -> Self {
        TtNodeConfig {
            update_interval: Duration::from_millis(100),
        }
    }
}

/// Write buffer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteBufferConfig {
    /// Buffered bytes per segment that trigger an automatic sync (default: 16MB)
    pub max_segment_buffer_bytes: usize,
}

impl Default for WriteBufferConfig {
    fn default() -> Self {
        WriteBufferConfig {
            max_segment_buffer_bytes: 16 * 1024 * 1024,
        }
    }
}

impl WriteBufferConfig {
    pub fn test() -> Self {
        WriteBufferConfig {
            max_segment_buffer_bytes: 1024,
        }
    }
}

/// Chunk store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStoreType {
    InMemory,
    LocalFs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkStoreConfig {
    pub store_type: ChunkStoreType,
    /// Base directory (LocalFs only)
    pub local_path: Option<PathBuf>,
    /// Key prefix for every object written
    pub root_path: String,
}

impl Default for ChunkStoreConfig {
    fn default() -> Self {
        ChunkStoreConfig {
            store_type: ChunkStoreType::InMemory,
            local_path: None,
            root_path: "files".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            filter: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Serde helper for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config_is_valid() {
        let config = DataNodeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.sync.parallel_task, 6);
        assert_eq!(config.tt_node.update_interval, Duration::from_secs(60));
        assert_eq!(config.store.store_type, ChunkStoreType::InMemory);
    }

    #[test]
    fn test_partial_toml() {
        let config = DataNodeConfig::from_toml_str(
            r#"
            [sync]
            parallel_task = 2
            storage_v2 = true

            [tt_node]
            update_interval = 250

            [store]
            store_type = "localfs"
            local_path = "/data/datanode"
            "#,
        )
        .unwrap();

        assert_eq!(config.sync.parallel_task, 2);
        assert!(config.sync.storage_v2);
        assert_eq!(config.tt_node.update_interval, Duration::from_millis(250));
        assert_eq!(config.store.store_type, ChunkStoreType::LocalFs);
        // Untouched sections keep defaults
        assert_eq!(config.checkpoint, CheckpointUpdaterConfig::default());
    }

    #[test]
    fn test_zero_parallelism_invalid() {
        let err = DataNodeConfig::from_toml_str("[sync]\nparallel_task = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_localfs_requires_path() {
        let err = DataNodeConfig::from_toml_str("[store]\nstore_type = \"localfs\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_bad_toml() {
        let err = DataNodeConfig::from_toml_str("[sync\nparallel_task = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("DATANODE_PARALLEL_TASK", "3"),
            ("DATANODE_STORAGE_V2", "1"),
            ("DATANODE_CP_UPDATE_INTERVAL_MS", "500"),
            ("DATANODE_STORE_TYPE", "localfs"),
            ("DATANODE_DATA_PATH", "/tmp/dn"),
            ("DATANODE_LOG_FORMAT", "json"),
        ]
        .into_iter()
        .collect();

        let mut config = DataNodeConfig::default();
        config
            .apply_overrides_from(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.sync.parallel_task, 3);
        assert!(config.sync.storage_v2);
        assert_eq!(config.tt_node.update_interval, Duration::from_millis(500));
        assert_eq!(config.store.local_path, Some(PathBuf::from("/tmp/dn")));
        assert_eq!(config.log.format, LogFormat::Json);
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = DataNodeConfig::default();
        let err = config
            .apply_overrides_from(|name| (name == "DATANODE_PARALLEL_TASK").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_config_serialization() {
        let config = DataNodeConfig::test();
        let text = toml::to_string(&config).unwrap();
        let parsed = DataNodeConfig::from_toml_str(&text).unwrap();
        assert_eq!(config, parsed);
    }
}
