//! Download queue repository.
//!
//! The queue is shared by all sites. Entries are consumed in order of
//! priority (highest first) and then enqueue time (oldest first).

use crate::error::MetadataResult;
use crate::models::QueueEntryRow;
use async_trait::async_trait;

/// Repository for pending downloads.
#[async_trait]
pub trait QueueRepo: Send + Sync {
    /// Get the queue entry of a file.
    async fn get_queue_entry(
        &self,
        site_id: &str,
        file_id: &str,
    ) -> MetadataResult<Option<QueueEntryRow>>;

    /// Insert a new entry.
    /// Returns false, leaving the table untouched, if the file is already queued.
    async fn insert_queue_entry(&self, entry: &QueueEntryRow) -> MetadataResult<bool>;

    /// Overwrite the mutable fields of an existing entry.
    async fn update_queue_entry(&self, entry: &QueueEntryRow) -> MetadataResult<()>;

    /// Remove an entry. Returns true if it existed.
    async fn delete_queue_entry(&self, site_id: &str, file_id: &str) -> MetadataResult<bool>;

    /// The entry to process next, if any.
    async fn next_queue_entry(&self) -> MetadataResult<Option<QueueEntryRow>>;

    /// List entries in processing order, optionally for one site.
    async fn list_queue_entries(&self, site_id: Option<&str>)
    -> MetadataResult<Vec<QueueEntryRow>>;

    /// Number of pending entries across all sites.
    async fn count_queue_entries(&self) -> MetadataResult<u64>;
}
