//! File registry repository.

use crate::error::MetadataResult;
use crate::models::FileRow;
use async_trait::async_trait;

/// Which registry rows a bulk invalidation marks stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleFilter {
    /// Every stored file.
    All,
    /// Only files whose freshness cannot be verified: external files and
    /// files with neither a revision nor a modification time.
    UnknownFreshness,
}

/// Repository for locally stored files.
#[async_trait]
pub trait FileRepo: Send + Sync {
    /// Get a stored file.
    async fn get_file(&self, site_id: &str, file_id: &str) -> MetadataResult<Option<FileRow>>;

    /// Insert or replace a stored file.
    async fn upsert_file(&self, file: &FileRow) -> MetadataResult<()>;

    /// Delete a stored file and all its links.
    /// Returns true if the file row existed.
    async fn delete_file(&self, site_id: &str, file_id: &str) -> MetadataResult<bool>;

    /// Mark one file stale. Returns true if the file exists.
    async fn mark_file_stale(&self, site_id: &str, file_id: &str) -> MetadataResult<bool>;

    /// Mark files of a site stale. Returns the number of rows changed.
    async fn mark_stale(&self, site_id: &str, filter: StaleFilter) -> MetadataResult<u64>;

    /// List all stored files of a site.
    async fn list_files(&self, site_id: &str) -> MetadataResult<Vec<FileRow>>;
}
