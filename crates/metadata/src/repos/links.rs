//! Link table repository.

use crate::error::MetadataResult;
use crate::models::{FileLinkRow, FileRow};
use async_trait::async_trait;
use larder_core::FileLink;

/// Repository for file-to-component links.
///
/// A `component_id` of `None` in a query matches every id of the component.
#[async_trait]
pub trait LinkRepo: Send + Sync {
    /// Attach links to a file. Existing links are kept.
    async fn add_links(&self, site_id: &str, file_id: &str, links: &[FileLink])
    -> MetadataResult<()>;

    /// Links of one file.
    async fn links_for_file(&self, site_id: &str, file_id: &str)
    -> MetadataResult<Vec<FileLinkRow>>;

    /// Stored files linked to a component.
    async fn files_for_component(
        &self,
        site_id: &str,
        component: &str,
        component_id: Option<&str>,
    ) -> MetadataResult<Vec<FileRow>>;

    /// Remove a component's links. Returns the number of links removed.
    async fn delete_component_links(
        &self,
        site_id: &str,
        component: &str,
        component_id: Option<&str>,
    ) -> MetadataResult<u64>;

    /// Number of links still referencing a file.
    async fn count_file_links(&self, site_id: &str, file_id: &str) -> MetadataResult<u64>;

    /// Sum of stored sizes of the files linked to a component.
    async fn component_disk_usage(
        &self,
        site_id: &str,
        component: &str,
        component_id: Option<&str>,
    ) -> MetadataResult<u64>;
}
