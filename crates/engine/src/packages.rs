//! Package status tracking.

use crate::error::EngineResult;
use crate::events::{EngineEvent, EventBus, PackageStatusEvent};
use larder_core::{DownloadStatus, PackageId, PackageState, aggregate};
use larder_metadata::repos::PackageRepo;
use larder_metadata::{MetadataStore, PackageRow};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info};

/// Records package lifecycle transitions and announces them.
#[derive(Clone)]
pub struct PackageTracker {
    metadata: Arc<dyn MetadataStore>,
    events: EventBus,
}

impl PackageTracker {
    pub fn new(metadata: Arc<dyn MetadataStore>, events: EventBus) -> Self {
        Self { metadata, events }
    }

    /// Stored row of a package, if any.
    pub async fn get_data(
        &self,
        site_id: &str,
        component: &str,
        component_id: &str,
    ) -> EngineResult<Option<PackageRow>> {
        let package_id = PackageId::new(component, component_id);
        Ok(self
            .metadata
            .get_package(site_id, package_id.as_str())
            .await?)
    }

    /// Current status; packages never seen are `NotDownloaded`.
    pub async fn get_status(
        &self,
        site_id: &str,
        component: &str,
        component_id: &str,
    ) -> EngineResult<DownloadStatus> {
        match self.get_data(site_id, component, component_id).await? {
            Some(row) => Ok(row.status()?),
            None => Ok(DownloadStatus::NotDownloaded),
        }
    }

    /// Overall status of several packages.
    pub async fn get_packages_status(
        &self,
        site_id: &str,
        packages: &[(String, String)],
    ) -> EngineResult<DownloadStatus> {
        let mut statuses = Vec::with_capacity(packages.len());
        for (component, component_id) in packages {
            statuses.push(self.get_status(site_id, component, component_id).await?);
        }
        Ok(aggregate(statuses))
    }

    /// Move a package to `status`. Writing the current status is a no-op.
    ///
    /// Returns whether anything changed.
    pub async fn store_status(
        &self,
        site_id: &str,
        component: &str,
        component_id: &str,
        status: DownloadStatus,
        extra: Option<String>,
    ) -> EngineResult<bool> {
        let package_id = PackageId::new(component, component_id);
        let current = self.current_state(site_id, &package_id).await?;
        let now = OffsetDateTime::now_utc();

        let Some(next) = PackageState::transition(current.as_ref(), status, extra, now) else {
            debug!(site_id, component, component_id, status = %status, "package status unchanged");
            return Ok(false);
        };
        self.write(site_id, &package_id, component, component_id, &next, now)
            .await?;
        Ok(true)
    }

    /// Return a package to the status it had before the last transition.
    pub async fn rollback(
        &self,
        site_id: &str,
        component: &str,
        component_id: &str,
    ) -> EngineResult<DownloadStatus> {
        let package_id = PackageId::new(component, component_id);
        let Some(current) = self.current_state(site_id, &package_id).await? else {
            return Ok(DownloadStatus::NotDownloaded);
        };
        let restored = current.rolled_back();
        if restored.status != current.status {
            self.write(
                site_id,
                &package_id,
                component,
                component_id,
                &restored,
                OffsetDateTime::now_utc(),
            )
            .await?;
        }
        Ok(restored.status)
    }

    /// Mark a known package as outdated. Unknown packages are left alone.
    pub async fn invalidate(
        &self,
        site_id: &str,
        component: &str,
        component_id: &str,
    ) -> EngineResult<bool> {
        let package_id = PackageId::new(component, component_id);
        if self.current_state(site_id, &package_id).await?.is_none() {
            return Ok(false);
        }
        self.store_status(
            site_id,
            component,
            component_id,
            DownloadStatus::Outdated,
            None,
        )
        .await
    }

    /// Forget every package of a site, announcing each as not downloaded.
    pub async fn clear_all(&self, site_id: &str) -> EngineResult<u64> {
        let rows = self.metadata.list_packages(site_id, None).await?;
        for row in &rows {
            self.emit(site_id, &row.component, &row.component_id, DownloadStatus::NotDownloaded);
        }
        let deleted = self.metadata.delete_site_packages(site_id).await?;
        info!(site_id, deleted, "package statuses cleared");
        Ok(deleted)
    }

    /// Stored packages of a site, optionally of one component.
    pub async fn list(
        &self,
        site_id: &str,
        component: Option<&str>,
    ) -> EngineResult<Vec<PackageRow>> {
        Ok(self.metadata.list_packages(site_id, component).await?)
    }

    async fn current_state(
        &self,
        site_id: &str,
        package_id: &PackageId,
    ) -> EngineResult<Option<PackageState>> {
        match self
            .metadata
            .get_package(site_id, package_id.as_str())
            .await?
        {
            Some(row) => Ok(Some(row.state()?)),
            None => Ok(None),
        }
    }

    async fn write(
        &self,
        site_id: &str,
        package_id: &PackageId,
        component: &str,
        component_id: &str,
        state: &PackageState,
        now: OffsetDateTime,
    ) -> EngineResult<()> {
        let row = PackageRow::from_state(
            site_id,
            package_id.as_str(),
            component,
            component_id,
            state,
            now,
        );
        self.metadata.upsert_package(&row).await?;
        debug!(site_id, component, component_id, status = %state.status, "package status stored");
        self.emit(site_id, component, component_id, state.status);
        Ok(())
    }

    fn emit(&self, site_id: &str, component: &str, component_id: &str, status: DownloadStatus) {
        self.events
            .emit(EngineEvent::PackageStatus(PackageStatusEvent {
                site_id: site_id.to_string(),
                component: component.to_string(),
                component_id: component_id.to_string(),
                status,
            }));
    }
}
