//! Metadata store abstraction and implementations for larder.
//!
//! This crate persists the cache engine's bookkeeping:
//! - The file registry (one row per locally stored file, per site)
//! - Links between stored files and the components using them
//! - The download queue shared by all sites
//! - Package status records

pub mod error;
pub mod models;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use models::{FileLinkRow, FileRow, PackageRow, QueueEntryRow};
pub use repos::StaleFilter;
pub use store::{MetadataStore, SqliteStore};

use larder_core::config::MetadataConfig;
use std::sync::Arc;

/// Create a metadata store from configuration.
pub async fn from_config(config: &MetadataConfig) -> MetadataResult<Arc<dyn MetadataStore>> {
    match config {
        MetadataConfig::Sqlite {
            path,
            busy_timeout_secs,
        } => {
            let store = SqliteStore::new(path, Some(*busy_timeout_secs)).await?;
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
    }
}
