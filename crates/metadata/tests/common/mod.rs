//! Shared helpers for metadata integration tests.

use larder_metadata::{FileRow, MetadataResult, MetadataStore, QueueEntryRow, SqliteStore};
use std::sync::Arc;
use tempfile::TempDir;
use time::OffsetDateTime;

/// A test metadata store wrapper that cleans up on drop.
pub struct TestMetadata {
    pub store: Arc<dyn MetadataStore>,
    _temp_dir: TempDir,
}

impl TestMetadata {
    /// Create a new SQLite store in a temporary directory.
    pub async fn new() -> MetadataResult<Self> {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let store = SqliteStore::new(temp_dir.path().join("test.db"), None).await?;
        Ok(Self {
            store: Arc::new(store),
            _temp_dir: temp_dir,
        })
    }

    /// Get a reference to the metadata store.
    pub fn store(&self) -> Arc<dyn MetadataStore> {
        self.store.clone()
    }
}

#[allow(dead_code)]
/// A stored file with the given revision markers.
pub fn file_row(
    site_id: &str,
    file_id: &str,
    revision: Option<i64>,
    time_modified: Option<i64>,
) -> FileRow {
    FileRow {
        site_id: site_id.to_string(),
        file_id: file_id.to_string(),
        url: format!("https://example.com/{file_id}"),
        path: format!("{site_id}/{file_id}"),
        extension: None,
        size: 100,
        revision,
        time_modified,
        is_external_file: false,
        repository_type: None,
        stale: false,
        download_time: OffsetDateTime::now_utc(),
    }
}

#[allow(dead_code)]
/// A queue entry added at `added` milliseconds.
pub fn queue_row(site_id: &str, file_id: &str, priority: i64, added: i64) -> QueueEntryRow {
    QueueEntryRow {
        site_id: site_id.to_string(),
        file_id: file_id.to_string(),
        url: format!("https://example.com/{file_id}"),
        priority,
        revision: None,
        time_modified: None,
        path: None,
        added,
        links: "[]".to_string(),
        is_external_file: false,
        repository_type: None,
    }
}
