//! Package status repository.

use crate::error::MetadataResult;
use crate::models::PackageRow;
use async_trait::async_trait;

/// Repository for package lifecycle records.
#[async_trait]
pub trait PackageRepo: Send + Sync {
    /// Get a package record.
    async fn get_package(&self, site_id: &str, package_id: &str)
    -> MetadataResult<Option<PackageRow>>;

    /// Insert or replace a package record.
    async fn upsert_package(&self, package: &PackageRow) -> MetadataResult<()>;

    /// List a site's packages, optionally restricted to one component.
    async fn list_packages(
        &self,
        site_id: &str,
        component: Option<&str>,
    ) -> MetadataResult<Vec<PackageRow>>;

    /// Delete every package record of a site. Returns the number removed.
    async fn delete_site_packages(&self, site_id: &str) -> MetadataResult<u64>;
}
