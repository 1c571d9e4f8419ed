//! Configuration types.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for a cache engine process.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    /// Where downloaded files are stored.
    pub storage: StorageConfig,

    /// Where registry, queue and package tables are persisted.
    pub metadata: MetadataConfig,

    /// Engine behaviour.
    #[serde(default)]
    pub engine: EngineConfig,
}

impl AppConfig {
    /// Validate all sections.
    pub fn validate(&self) -> Result<(), String> {
        self.storage.validate()?;
        self.metadata.validate()?;
        self.engine.validate()
    }
}

/// Local file storage configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for downloaded files.
        path: PathBuf,
    },
}

impl StorageConfig {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::Filesystem { path } if path.as_os_str().is_empty() => {
                Err("storage.path must not be empty".to_string())
            }
            StorageConfig::Filesystem { .. } => Ok(()),
        }
    }
}

/// Metadata database configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database file.
    Sqlite {
        /// Database file path.
        path: PathBuf,
        /// Busy timeout in seconds while another connection holds the write lock.
        #[serde(default = "default_sqlite_busy_timeout_secs")]
        busy_timeout_secs: u64,
    },
}

fn default_sqlite_busy_timeout_secs() -> u64 {
    5
}

impl MetadataConfig {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite { path, .. } if path.as_os_str().is_empty() => {
                Err("metadata.path must not be empty".to_string())
            }
            MetadataConfig::Sqlite { .. } => Ok(()),
        }
    }
}

/// Download queue and auto-download behaviour.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Files up to this size are auto-downloaded on any connection.
    #[serde(default = "default_download_threshold_bytes")]
    pub download_threshold_bytes: u64,

    /// Files up to this size are auto-downloaded on unmetered connections.
    #[serde(default = "default_unmetered_download_threshold_bytes")]
    pub unmetered_download_threshold_bytes: u64,

    /// Pause before retrying a queue entry after a transient failure.
    #[serde(default = "default_transient_retry_delay_ms")]
    pub transient_retry_delay_ms: u64,

    /// Buffered events per subscriber before old ones are dropped.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Highest accepted queue priority; larger values are clamped.
    #[serde(default = "default_max_priority")]
    pub max_priority: i64,
}

fn default_download_threshold_bytes() -> u64 {
    2 * 1024 * 1024
}

fn default_unmetered_download_threshold_bytes() -> u64 {
    20 * 1024 * 1024
}

fn default_transient_retry_delay_ms() -> u64 {
    5_000
}

fn default_event_capacity() -> usize {
    256
}

fn default_max_priority() -> i64 {
    999
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_threshold_bytes: default_download_threshold_bytes(),
            unmetered_download_threshold_bytes: default_unmetered_download_threshold_bytes(),
            transient_retry_delay_ms: default_transient_retry_delay_ms(),
            event_capacity: default_event_capacity(),
            max_priority: default_max_priority(),
        }
    }
}

impl EngineConfig {
    /// Get the transient retry delay as a Duration.
    pub fn transient_retry_delay(&self) -> Duration {
        Duration::from_millis(self.transient_retry_delay_ms)
    }

    /// Whether a file of `size` bytes should be fetched without asking.
    pub fn should_auto_download(&self, size: u64, metered: bool) -> bool {
        size <= self.download_threshold_bytes
            || (!metered && size <= self.unmetered_download_threshold_bytes)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.unmetered_download_threshold_bytes < self.download_threshold_bytes {
            return Err(format!(
                "engine.unmetered_download_threshold_bytes {} is below engine.download_threshold_bytes {}",
                self.unmetered_download_threshold_bytes, self.download_threshold_bytes
            ));
        }
        if self.event_capacity == 0 {
            return Err("engine.event_capacity must be at least 1".to_string());
        }
        if self.max_priority < 0 {
            return Err(format!(
                "engine.max_priority {} must not be negative",
                self.max_priority
            ));
        }
        Ok(())
    }
}
