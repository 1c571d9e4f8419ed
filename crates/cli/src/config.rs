//! Configuration loading.
//!
//! Built-in defaults, then the TOML file, then `LARDER_` environment
//! variables (nested keys split on `__`, e.g. `LARDER_ENGINE__MAX_PRIORITY`).

use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use larder_core::config::{AppConfig, EngineConfig, MetadataConfig, StorageConfig};
use std::path::{Path, PathBuf};

const DEFAULT_DATA_DIR: &str = "larder-data";

/// Configuration used when nothing else is provided.
pub fn default_config() -> AppConfig {
    let data_dir = PathBuf::from(DEFAULT_DATA_DIR);
    AppConfig {
        storage: StorageConfig::Filesystem {
            path: data_dir.join("files"),
        },
        metadata: MetadataConfig::Sqlite {
            path: data_dir.join("larder.db"),
            busy_timeout_secs: 5,
        },
        engine: EngineConfig::default(),
    }
}

fn figment(config_path: &Path) -> Figment {
    let mut figment = Figment::from(Serialized::defaults(default_config()));
    if config_path.exists() {
        tracing::debug!(config_path = %config_path.display(), "loading configuration from file");
        figment = figment.merge(Toml::file(config_path));
    } else {
        tracing::debug!("no config file found at {}", config_path.display());
    }
    figment.merge(Env::prefixed("LARDER_").split("__"))
}

/// Load and validate the configuration.
pub fn load(config_path: &Path) -> Result<AppConfig> {
    let config: AppConfig = figment(config_path)
        .extract()
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("invalid configuration")?;
    Ok(config)
}
