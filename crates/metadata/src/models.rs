//! Database models mapping to the metadata schema.

use crate::error::{MetadataError, MetadataResult};
use larder_core::freshness::{self, Version};
use larder_core::{DownloadStatus, FileId, FileLink, PackageState};
use sqlx::FromRow;
use time::OffsetDateTime;

// =============================================================================
// File registry
// =============================================================================

/// A locally stored copy of a remote file.
#[derive(Debug, Clone, FromRow)]
pub struct FileRow {
    pub site_id: String,
    pub file_id: String,
    /// Last known remote URL.
    pub url: String,
    /// Storage key of the local copy.
    pub path: String,
    pub extension: Option<String>,
    pub size: i64,
    pub revision: Option<i64>,
    pub time_modified: Option<i64>,
    pub is_external_file: bool,
    pub repository_type: Option<String>,
    pub stale: bool,
    pub download_time: OffsetDateTime,
}

impl FileRow {
    pub fn file_id(&self) -> FileId {
        FileId::from_stored(self.file_id.clone())
    }

    pub fn version(&self) -> Version {
        Version::new(self.revision, self.time_modified)
    }

    /// Stale, or older than the requested revision markers.
    pub fn is_outdated(&self, requested: &Version) -> bool {
        freshness::is_outdated(self.stale, &self.version(), requested)
    }

    /// Freshness cannot be checked against the remote.
    pub fn is_freshness_unknown(&self) -> bool {
        freshness::is_freshness_unknown(self.stale, self.is_external_file, &self.version())
    }
}

/// Link between a stored file and a component using it.
#[derive(Debug, Clone, FromRow)]
pub struct FileLinkRow {
    pub site_id: String,
    pub file_id: String,
    pub component: String,
    pub component_id: String,
}

impl From<FileLinkRow> for FileLink {
    fn from(row: FileLinkRow) -> Self {
        FileLink {
            component: row.component,
            component_id: row.component_id,
        }
    }
}

// =============================================================================
// Download queue
// =============================================================================

/// Pending single-file download.
#[derive(Debug, Clone, FromRow)]
pub struct QueueEntryRow {
    pub site_id: String,
    pub file_id: String,
    pub url: String,
    pub priority: i64,
    pub revision: Option<i64>,
    pub time_modified: Option<i64>,
    pub path: Option<String>,
    /// Enqueue time in unix milliseconds.
    pub added: i64,
    /// JSON array of links attached on success.
    pub links: String,
    pub is_external_file: bool,
    pub repository_type: Option<String>,
}

impl QueueEntryRow {
    pub fn file_id(&self) -> FileId {
        FileId::from_stored(self.file_id.clone())
    }

    pub fn version(&self) -> Version {
        Version::new(self.revision, self.time_modified)
    }

    pub fn links(&self) -> MetadataResult<Vec<FileLink>> {
        if self.links.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&self.links).map_err(|e| {
            MetadataError::Internal(format!(
                "corrupt links for queued file {}: {e}",
                self.file_id
            ))
        })
    }

    pub fn set_links(&mut self, links: &[FileLink]) -> MetadataResult<()> {
        self.links = serde_json::to_string(links)
            .map_err(|e| MetadataError::Internal(format!("failed to encode links: {e}")))?;
        Ok(())
    }
}

// =============================================================================
// Package status
// =============================================================================

/// Lifecycle record of one package.
#[derive(Debug, Clone, FromRow)]
pub struct PackageRow {
    pub site_id: String,
    pub package_id: String,
    pub component: String,
    pub component_id: String,
    pub status: String,
    pub previous_status: Option<String>,
    pub updated_at: OffsetDateTime,
    pub download_time: Option<OffsetDateTime>,
    pub previous_download_time: Option<OffsetDateTime>,
    pub extra: Option<String>,
}

impl PackageRow {
    pub fn status(&self) -> MetadataResult<DownloadStatus> {
        DownloadStatus::parse(&self.status).map_err(|e| MetadataError::Internal(e.to_string()))
    }

    pub fn state(&self) -> MetadataResult<PackageState> {
        let previous_status = self
            .previous_status
            .as_deref()
            .map(DownloadStatus::parse)
            .transpose()
            .map_err(|e| MetadataError::Internal(e.to_string()))?;
        Ok(PackageState {
            status: self.status()?,
            previous_status,
            download_time: self.download_time,
            previous_download_time: self.previous_download_time,
            extra: self.extra.clone(),
        })
    }

    /// Row holding `state` for the given package.
    pub fn from_state(
        site_id: &str,
        package_id: &str,
        component: &str,
        component_id: &str,
        state: &PackageState,
        updated_at: OffsetDateTime,
    ) -> Self {
        Self {
            site_id: site_id.to_string(),
            package_id: package_id.to_string(),
            component: component.to_string(),
            component_id: component_id.to_string(),
            status: state.status.as_str().to_string(),
            previous_status: state.previous_status.map(|s| s.as_str().to_string()),
            updated_at,
            download_time: state.download_time,
            previous_download_time: state.previous_download_time,
            extra: state.extra.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_row(links: &str) -> QueueEntryRow {
        QueueEntryRow {
            site_id: "s".into(),
            file_id: "f".into(),
            url: "https://h/f".into(),
            priority: 0,
            revision: None,
            time_modified: None,
            path: None,
            added: 0,
            links: links.into(),
            is_external_file: false,
            repository_type: None,
        }
    }

    #[test]
    fn test_queue_links_roundtrip() {
        let mut row = queue_row("");
        assert!(row.links().unwrap().is_empty());
        let links = vec![FileLink::new("mod_page", Some("1"))];
        row.set_links(&links).unwrap();
        assert_eq!(row.links().unwrap(), links);
    }

    #[test]
    fn test_queue_links_corrupt() {
        assert!(matches!(
            queue_row("{not json").links(),
            Err(MetadataError::Internal(_))
        ));
    }

    #[test]
    fn test_package_row_state_roundtrip() {
        let state = PackageState {
            status: DownloadStatus::Downloaded,
            previous_status: Some(DownloadStatus::Downloading),
            download_time: Some(OffsetDateTime::UNIX_EPOCH),
            previous_download_time: None,
            extra: Some("e".into()),
        };
        let row = PackageRow::from_state("s", "p", "c", "1", &state, OffsetDateTime::UNIX_EPOCH);
        assert_eq!(row.state().unwrap(), state);
    }
}
