//! Local file storage for cached downloads.
//!
//! This crate provides:
//! - The [`FileStore`] abstraction used by the download engine
//! - Atomic streaming writes
//! - A local filesystem backend with path traversal protection

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::filesystem::FilesystemBackend;
pub use error::{StorageError, StorageResult};
pub use traits::{FileStore, StreamingUpload};

use larder_core::config::StorageConfig;
use std::sync::Arc;

/// Create a file store from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn FileStore>> {
    config.validate().map_err(StorageError::Config)?;

    match config {
        StorageConfig::Filesystem { path } => {
            let backend = FilesystemBackend::new(path).await?;
            Ok(Arc::new(backend))
        }
    }
}
