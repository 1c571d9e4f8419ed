//! The engine façade.
//!
//! Answers "give me a usable URL for this remote file" and "download or
//! invalidate this package", hiding queueing and freshness decisions from
//! callers.

use crate::download::{DownloadRequest, Downloader};
use crate::error::{EngineError, EngineResult};
use crate::events::{EventBus, EventFilter, EventStream};
use crate::fetch::Fetcher;
use crate::inflight::Inflight;
use crate::metrics;
use crate::packages::PackageTracker;
use crate::queue::{DownloadQueue, DownloadTask, QueueRequest, QueueState};
use crate::sites::{NetworkStatus, Site, SiteRegistry};
use dashmap::DashMap;
use larder_core::config::EngineConfig;
use larder_core::file_id::{remove_volatile_params, with_fragment_of};
use larder_core::{
    DownloadStatus, FileId, FileLink, FileMeta, PackageId, RemoteFile, Version, aggregate,
};
use larder_metadata::repos::{FileRepo, LinkRepo, QueueRepo, StaleFilter};
use larder_metadata::{FileRow, MetadataStore, PackageRow, QueueEntryRow};
use larder_storage::FileStore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Size gate applied before a file is queued in the background.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SizeCheck {
    /// Queue regardless of size.
    pub force: bool,
    /// Queue files of unknown size when on an unmetered connection.
    pub download_unknown: bool,
}

/// Options for URL resolution.
#[derive(Clone, Debug, Default)]
pub struct ResolveOptions {
    /// Component to link the file to once downloaded.
    pub link: Option<FileLink>,
    /// Queue priority of the background download.
    pub priority: i64,
    /// Only queue files that pass this size gate. `None` always queues.
    pub size_check: Option<SizeCheck>,
}

impl ResolveOptions {
    pub fn linked(component: impl Into<String>, component_id: Option<&str>) -> Self {
        Self {
            link: Some(FileLink::new(component, component_id)),
            ..Default::default()
        }
    }
}

/// Which registry rows an invalidation touches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InvalidateScope {
    All,
    Component {
        component: String,
        component_id: Option<String>,
    },
}

/// How a package's files are fetched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PackageMode {
    /// One immediate transfer per file.
    Direct,
    /// Through the download queue.
    Queued,
}

/// Cache engine for one process, shared by all sites.
pub struct Engine {
    config: EngineConfig,
    sites: SiteRegistry,
    network: Arc<dyn NetworkStatus>,
    metadata: Arc<dyn MetadataStore>,
    storage: Arc<dyn FileStore>,
    fetcher: Arc<dyn Fetcher>,
    downloader: Arc<Downloader>,
    queue: Arc<DownloadQueue>,
    packages: PackageTracker,
    package_ops: Inflight<(String, PackageId), ()>,
    size_cache: Arc<DashMap<String, Option<u64>>>,
    events: EventBus,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        metadata: Arc<dyn MetadataStore>,
        storage: Arc<dyn FileStore>,
        fetcher: Arc<dyn Fetcher>,
        network: Arc<dyn NetworkStatus>,
    ) -> Self {
        let events = EventBus::new(config.event_capacity);
        let sites = SiteRegistry::new();
        let downloader = Arc::new(Downloader::new(
            metadata.clone(),
            storage.clone(),
            fetcher.clone(),
            network.clone(),
            events.clone(),
        ));
        let queue = Arc::new(DownloadQueue::new(
            metadata.clone(),
            storage.clone(),
            network.clone(),
            sites.clone(),
            downloader.clone(),
            events.clone(),
            config.transient_retry_delay(),
            config.max_priority,
        ));
        let packages = PackageTracker::new(metadata.clone(), events.clone());

        Self {
            config,
            sites,
            network,
            metadata,
            storage,
            fetcher,
            downloader,
            queue,
            packages,
            package_ops: Inflight::new(),
            size_cache: Arc::new(DashMap::new()),
            events,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn sites(&self) -> &SiteRegistry {
        &self.sites
    }

    pub fn register_site(&self, site: Arc<dyn Site>) {
        self.sites.register(site);
    }

    /// Receive the events matching `filter`.
    pub fn subscribe(&self, filter: EventFilter) -> EventStream {
        self.events.subscribe(filter)
    }

    // =========================================================================
    // Queue control
    // =========================================================================

    /// Check the store and start processing whatever is queued.
    pub async fn start(&self) -> EngineResult<()> {
        self.metadata.health_check().await?;
        let queued = self.metadata.count_queue_entries().await?;
        metrics::QUEUE_DEPTH.set(queued as i64);
        info!(queued, "cache engine started");
        self.queue.check_processing().await;
        Ok(())
    }

    /// Resume the queue if the environment allows. Call on connectivity changes.
    pub async fn check_queue_processing(&self) {
        self.queue.check_processing().await;
    }

    pub fn pause_queue(&self) {
        self.queue.pause();
    }

    pub fn queue_state(&self) -> QueueState {
        self.queue.state()
    }

    pub async fn wait_until_idle(&self) {
        self.queue.wait_until_idle().await;
    }

    pub async fn queue_entries(&self, site_id: Option<&str>) -> EngineResult<Vec<QueueEntryRow>> {
        self.queue.entries(site_id).await
    }

    /// Queue a file and get a handle that settles once it is downloaded.
    pub async fn add_to_queue(
        &self,
        site_id: &str,
        file: RemoteFile,
        priority: i64,
        link: Option<FileLink>,
    ) -> EngineResult<Arc<DownloadTask>> {
        let (url, meta) = file.into_parts();
        let request = QueueRequest::new(site_id, url)
            .with_meta(meta)
            .with_priority(priority)
            .with_link(link);
        self.queue.enqueue(request).await
    }

    // =========================================================================
    // Resolution
    // =========================================================================

    /// A usable location for a remote file: the local path when a current
    /// copy exists, otherwise the remote URL while a download is queued in
    /// the background. Offline, any local copy is served.
    pub async fn resolve_url(
        &self,
        site_id: &str,
        file: RemoteFile,
        options: ResolveOptions,
    ) -> EngineResult<String> {
        self.resolve(site_id, file, options, false).await
    }

    /// Like [`Engine::resolve_url`], with local copies given as `file://` URLs.
    pub async fn resolve_src(
        &self,
        site_id: &str,
        file: RemoteFile,
        options: ResolveOptions,
    ) -> EngineResult<String> {
        self.resolve(site_id, file, options, true).await
    }

    /// Resolve a URL, queueing the background download only for files small
    /// enough for the current connection.
    pub async fn resolve_url_with_size_check(
        &self,
        site_id: &str,
        file: RemoteFile,
        link: Option<FileLink>,
        check: SizeCheck,
    ) -> EngineResult<String> {
        let options = ResolveOptions {
            link,
            size_check: Some(check),
            ..Default::default()
        };
        self.resolve(site_id, file, options, false).await
    }

    async fn resolve(
        &self,
        site_id: &str,
        file: RemoteFile,
        options: ResolveOptions,
        as_src: bool,
    ) -> EngineResult<String> {
        let site = self.sites.get(site_id)?;
        let known_size = match &file {
            RemoteFile::ByDescriptor { descriptor, .. } => descriptor.filesize,
            RemoteFile::ByUrl { .. } => None,
        };
        let (url, meta) = file.into_parts();
        let file_id = FileId::from_url(&url);
        let requested = meta.version_for(&url);
        let remote = site.fix_url(&url);

        let row = match self.metadata.get_file(site_id, file_id.as_str()).await {
            Ok(row) => row,
            Err(e) => {
                warn!(site_id, file_id = %file_id, error = %e, "registry lookup failed");
                None
            }
        };

        let Some(row) = row else {
            self.schedule(site, url, meta, known_size, options);
            return Ok(remote);
        };

        let Some(location) = self.local_location(&row, as_src).await else {
            debug!(site_id, file_id = %file_id, path = %row.path, "stored file missing on disk");
            if let Err(e) = self.metadata.delete_file(site_id, file_id.as_str()).await {
                warn!(site_id, file_id = %file_id, error = %e, "failed to drop registry row");
            }
            self.schedule(site, url, meta, known_size, options);
            return Ok(remote);
        };

        if self.network.is_online() && row.is_outdated(&requested) {
            self.schedule(site, url, meta, known_size, options);
            return Ok(remote);
        }
        Ok(with_fragment_of(location, &url))
    }

    async fn local_location(&self, row: &FileRow, as_src: bool) -> Option<String> {
        match self.storage.exists(&row.path).await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                warn!(path = %row.path, error = %e, "failed to check local copy");
                return None;
            }
        }
        let path = self.storage.local_path(&row.path).await.ok()?;
        if as_src {
            url::Url::from_file_path(&path)
                .map(|u| u.to_string())
                .ok()
        } else {
            Some(path.to_string_lossy().into_owned())
        }
    }

    /// Queue a download in the background. Errors are logged and dropped.
    fn schedule(
        &self,
        site: Arc<dyn Site>,
        url: String,
        meta: FileMeta,
        known_size: Option<u64>,
        options: ResolveOptions,
    ) {
        if !self.network.is_online() || !site.can_download_files() {
            return;
        }

        let queue = self.queue.clone();
        let fetcher = self.fetcher.clone();
        let size_cache = self.size_cache.clone();
        let config = self.config.clone();
        let metered = self.network.is_metered();
        let site_id = site.id().to_string();

        tokio::spawn(async move {
            if let Some(check) = options.size_check {
                let size = match known_size {
                    Some(size) => Some(size),
                    None => remote_size(fetcher.as_ref(), &size_cache, site.as_ref(), &url).await,
                };
                if !size_allows(&config, check, size, metered) {
                    debug!(site_id = %site_id, url = %url, ?size, "not queued, file too large");
                    return;
                }
            }

            let request = QueueRequest::new(site_id.clone(), url)
                .with_meta(meta)
                .with_priority(options.priority)
                .with_link(options.link);
            if let Err(e) = queue.enqueue(request).await {
                debug!(site_id = %site_id, error = %e, "background enqueue failed");
            }
        });
    }

    // =========================================================================
    // Direct downloads
    // =========================================================================

    /// Download one file now and return its local path.
    ///
    /// A current local copy (or any local copy with `ignore_stale`) is
    /// returned without a transfer.
    pub async fn download_url(
        &self,
        site_id: &str,
        file: RemoteFile,
        link: Option<FileLink>,
        ignore_stale: bool,
    ) -> EngineResult<PathBuf> {
        let site = self.sites.get(site_id)?;
        if !site.can_download_files() {
            return Err(EngineError::DownloadsDisabled(site_id.to_string()));
        }
        let (url, meta) = file.into_parts();
        let links: Vec<FileLink> = link.into_iter().collect();
        let row = self
            .downloader
            .download(site, DownloadRequest::new(url, meta), &links, ignore_stale)
            .await?;
        Ok(self.storage.local_path(&row.path).await?)
    }

    /// Download every file of a package right away.
    ///
    /// The package is `Downloading` meanwhile, `Downloaded` on success and
    /// back at its previous status on failure. Concurrent calls for the same
    /// package share one run.
    pub async fn download_package(
        &self,
        site_id: &str,
        files: Vec<RemoteFile>,
        component: &str,
        component_id: &str,
        extra: Option<String>,
    ) -> EngineResult<()> {
        self.run_package(site_id, files, component, component_id, extra, PackageMode::Direct)
            .await
    }

    /// Like [`Engine::download_package`], with the files going through the
    /// download queue.
    pub async fn prefetch_package(
        &self,
        site_id: &str,
        files: Vec<RemoteFile>,
        component: &str,
        component_id: &str,
        extra: Option<String>,
    ) -> EngineResult<()> {
        self.run_package(site_id, files, component, component_id, extra, PackageMode::Queued)
            .await
    }

    async fn run_package(
        &self,
        site_id: &str,
        files: Vec<RemoteFile>,
        component: &str,
        component_id: &str,
        extra: Option<String>,
        mode: PackageMode,
    ) -> EngineResult<()> {
        let key = (
            site_id.to_string(),
            PackageId::new(component, component_id),
        );
        let site = self.sites.get(site_id)?;
        let downloader = self.downloader.clone();
        let queue = self.queue.clone();
        let packages = self.packages.clone();
        let component = component.to_string();
        let component_id = component_id.to_string();

        let op = async move {
            if !site.can_download_files() {
                return Err(EngineError::DownloadsDisabled(site.id().to_string()));
            }
            let site_id = site.id().to_string();
            packages
                .store_status(
                    &site_id,
                    &component,
                    &component_id,
                    DownloadStatus::Downloading,
                    None,
                )
                .await?;

            let links = vec![FileLink::new(component.clone(), Some(&component_id))];
            let transfer = async {
                match mode {
                    PackageMode::Direct => {
                        let downloads = files.into_iter().map(|file| {
                            let (url, meta) = file.into_parts();
                            downloader.download(
                                site.clone(),
                                DownloadRequest::new(url, meta),
                                &links,
                                false,
                            )
                        });
                        futures::future::try_join_all(downloads).await?;
                    }
                    PackageMode::Queued => {
                        let mut tasks = Vec::with_capacity(files.len());
                        for file in files {
                            let (url, meta) = file.into_parts();
                            let request = QueueRequest::new(site_id.clone(), url)
                                .with_meta(meta)
                                .with_link(links.first().cloned());
                            tasks.push(queue.enqueue(request).await?);
                        }
                        futures::future::try_join_all(tasks.iter().map(|task| task.wait()))
                            .await?;
                    }
                }
                Ok::<(), EngineError>(())
            };

            match transfer.await {
                Ok(()) => {
                    packages
                        .store_status(
                            &site_id,
                            &component,
                            &component_id,
                            DownloadStatus::Downloaded,
                            extra,
                        )
                        .await?;
                    metrics::record_package_operation("downloaded");
                    info!(site_id = %site_id, component = %component, component_id = %component_id, "package downloaded");
                    Ok(())
                }
                Err(e) => {
                    match packages.rollback(&site_id, &component, &component_id).await {
                        Ok(status) => {
                            warn!(site_id = %site_id, component = %component, component_id = %component_id, restored = %status, error = %e, "package download failed")
                        }
                        Err(rollback_err) => {
                            warn!(site_id = %site_id, component = %component, component_id = %component_id, error = %rollback_err, "failed to roll back package status")
                        }
                    }
                    metrics::record_package_operation("failed");
                    Err(e)
                }
            }
        };

        self.package_ops.run(key, op).await
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub async fn get_package_status(
        &self,
        site_id: &str,
        component: &str,
        component_id: &str,
    ) -> EngineResult<DownloadStatus> {
        self.packages
            .get_status(site_id, component, component_id)
            .await
    }

    pub async fn get_package_data(
        &self,
        site_id: &str,
        component: &str,
        component_id: &str,
    ) -> EngineResult<Option<PackageRow>> {
        self.packages.get_data(site_id, component, component_id).await
    }

    /// Overall status of several `(component, component_id)` packages.
    pub async fn get_packages_status(
        &self,
        site_id: &str,
        packages: &[(String, String)],
    ) -> EngineResult<DownloadStatus> {
        self.packages.get_packages_status(site_id, packages).await
    }

    pub async fn list_packages(
        &self,
        site_id: &str,
        component: Option<&str>,
    ) -> EngineResult<Vec<PackageRow>> {
        self.packages.list(site_id, component).await
    }

    /// Status of one remote file.
    pub async fn get_file_state(
        &self,
        site_id: &str,
        url: &str,
        requested: Version,
    ) -> EngineResult<DownloadStatus> {
        let file_id = FileId::from_url(url);
        if self.queue.has_pending_task(site_id, &file_id)
            || self.downloader.is_downloading(site_id, &file_id)
            || self
                .metadata
                .get_queue_entry(site_id, file_id.as_str())
                .await?
                .is_some()
        {
            return Ok(DownloadStatus::Downloading);
        }

        let requested = Version::new(
            requested
                .revision
                .or_else(|| larder_core::file_id::revision_from_url(url)),
            requested.time_modified,
        );
        match self.metadata.get_file(site_id, file_id.as_str()).await? {
            Some(row) if row.is_outdated(&requested) => Ok(DownloadStatus::Outdated),
            Some(_) => Ok(DownloadStatus::Downloaded),
            None => Ok(DownloadStatus::NotDownloaded),
        }
    }

    /// Overall status of a set of files. An empty set is not downloadable.
    pub async fn get_files_status(
        &self,
        site_id: &str,
        files: Vec<RemoteFile>,
    ) -> EngineResult<DownloadStatus> {
        let mut statuses = Vec::with_capacity(files.len());
        for file in files {
            let (url, meta) = file.into_parts();
            let version = Version::new(meta.revision, meta.time_modified);
            statuses.push(self.get_file_state(site_id, &url, version).await?);
        }
        Ok(aggregate(statuses))
    }

    pub async fn get_files_by_component(
        &self,
        site_id: &str,
        component: &str,
        component_id: Option<&str>,
    ) -> EngineResult<Vec<FileRow>> {
        Ok(self
            .metadata
            .files_for_component(site_id, component, component_id)
            .await?)
    }

    /// Bytes used by the files linked to a component.
    pub async fn get_component_disk_usage(
        &self,
        site_id: &str,
        component: &str,
        component_id: Option<&str>,
    ) -> EngineResult<u64> {
        Ok(self
            .metadata
            .component_disk_usage(site_id, component, component_id)
            .await?)
    }

    pub async fn list_files(&self, site_id: &str) -> EngineResult<Vec<FileRow>> {
        Ok(self.metadata.list_files(site_id).await?)
    }

    // =========================================================================
    // Invalidation
    // =========================================================================

    /// Mark one file stale. Returns false if it is not stored.
    pub async fn invalidate_file(&self, site_id: &str, url: &str) -> EngineResult<bool> {
        let file_id = FileId::from_url(url);
        Ok(self
            .metadata
            .mark_file_stale(site_id, file_id.as_str())
            .await?)
    }

    /// Mark stored files stale. With `only_unknown`, files whose freshness
    /// can be verified are left alone.
    ///
    /// Neither the queue nor package statuses change; staleness shows up
    /// the next time the files are resolved.
    pub async fn invalidate(
        &self,
        site_id: &str,
        scope: InvalidateScope,
        only_unknown: bool,
    ) -> EngineResult<u64> {
        let marked = match scope {
            InvalidateScope::All => {
                let filter = if only_unknown {
                    StaleFilter::UnknownFreshness
                } else {
                    StaleFilter::All
                };
                self.metadata.mark_stale(site_id, filter).await?
            }
            InvalidateScope::Component {
                component,
                component_id,
            } => {
                let files = self
                    .metadata
                    .files_for_component(site_id, &component, component_id.as_deref())
                    .await?;
                let mut marked = 0;
                for row in files {
                    if only_unknown && !row.is_freshness_unknown() {
                        continue;
                    }
                    if self.metadata.mark_file_stale(site_id, &row.file_id).await? {
                        marked += 1;
                    }
                }
                marked
            }
        };
        info!(site_id, marked, only_unknown, "files invalidated");
        Ok(marked)
    }

    /// Mark a package outdated. Returns false for packages never stored.
    pub async fn invalidate_package(
        &self,
        site_id: &str,
        component: &str,
        component_id: &str,
    ) -> EngineResult<bool> {
        self.packages
            .invalidate(site_id, component, component_id)
            .await
    }

    // =========================================================================
    // Removal
    // =========================================================================

    pub async fn remove_file_by_url(&self, site_id: &str, url: &str) -> EngineResult<bool> {
        self.downloader
            .remove_file(site_id, &FileId::from_url(url))
            .await
    }

    /// Unlink a component from its files and delete the files no other
    /// component uses. Returns how many files were deleted.
    pub async fn remove_files_by_component(
        &self,
        site_id: &str,
        component: &str,
        component_id: Option<&str>,
    ) -> EngineResult<u64> {
        let files = self
            .metadata
            .files_for_component(site_id, component, component_id)
            .await?;
        self.metadata
            .delete_component_links(site_id, component, component_id)
            .await?;

        let mut removed = 0;
        for row in files {
            if self.metadata.count_file_links(site_id, &row.file_id).await? > 0 {
                continue;
            }
            if self.downloader.remove_file(site_id, &row.file_id()).await? {
                removed += 1;
            }
        }
        info!(site_id, component, removed, "component files removed");
        Ok(removed)
    }

    pub async fn clear_all_packages_status(&self, site_id: &str) -> EngineResult<u64> {
        self.packages.clear_all(site_id).await
    }
}

async fn remote_size(
    fetcher: &dyn Fetcher,
    cache: &DashMap<String, Option<u64>>,
    site: &dyn Site,
    url: &str,
) -> Option<u64> {
    let key = remove_volatile_params(url);
    if let Some(size) = cache.get(&key) {
        return *size;
    }
    match fetcher.remote_size(&site.fix_url(url)).await {
        Ok(size) => {
            cache.insert(key, size);
            size
        }
        Err(e) => {
            debug!(url, error = %e, "remote size lookup failed");
            None
        }
    }
}

/// Whether a file passes the size gate.
fn size_allows(config: &EngineConfig, check: SizeCheck, size: Option<u64>, metered: bool) -> bool {
    if check.force {
        return true;
    }
    match size {
        Some(size) => config.should_auto_download(size, metered),
        None => check.download_unknown && !metered,
    }
}
