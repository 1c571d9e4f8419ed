//! Persistent download queue and its processor.
//!
//! Entries live in the metadata store so they survive restarts. One
//! processing loop runs at a time: it takes the highest priority, oldest
//! entry, downloads it and moves straight on to the next one until the
//! queue is empty or the environment becomes unavailable.

use crate::download::{DownloadProgress, DownloadRequest, Downloader, ProgressSender};
use crate::error::{EngineError, EngineResult, FailureClass};
use crate::events::{EventBus, FileAction};
use crate::metrics;
use crate::sites::{NetworkStatus, SiteRegistry};
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use larder_core::{FileId, FileLink, FileMeta};
use larder_metadata::repos::{FileRepo, QueueRepo};
use larder_metadata::{MetadataResult, MetadataStore, QueueEntryRow};
use larder_storage::FileStore;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

/// State of the whole queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Paused,
    Running,
}

/// Completion handle for one queued file.
///
/// Settles when the file is downloaded or dropped from the queue. A
/// transient failure leaves it pending while the entry waits for a retry.
#[derive(Debug)]
pub struct DownloadTask {
    outcome: watch::Sender<Option<EngineResult<()>>>,
    progress: ProgressSender,
}

impl DownloadTask {
    fn new() -> Arc<Self> {
        let (outcome, _) = watch::channel(None);
        let (progress, _) = watch::channel(None);
        Arc::new(Self {
            outcome,
            progress: Arc::new(progress),
        })
    }

    fn settle(&self, result: EngineResult<()>) {
        self.outcome.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(result);
            true
        });
    }

    pub(crate) fn resolve(&self) {
        self.settle(Ok(()));
    }

    pub(crate) fn reject(&self, error: EngineError) {
        self.settle(Err(error));
    }

    pub fn is_settled(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// Latest progress of the transfer; `None` until it starts.
    pub fn progress(&self) -> watch::Receiver<Option<DownloadProgress>> {
        self.progress.subscribe()
    }

    /// Wait for the file to finish downloading.
    pub async fn wait(&self) -> EngineResult<()> {
        let mut outcome = self.outcome.subscribe();
        match outcome.wait_for(Option::is_some).await {
            Ok(settled) => settled
                .clone()
                .unwrap_or_else(|| Err(EngineError::Internal("task settled empty".into()))),
            Err(_) => Err(EngineError::Internal("download task dropped".into())),
        }
    }
}

/// A file to add to the queue.
#[derive(Clone, Debug)]
pub struct QueueRequest {
    pub site_id: String,
    pub url: String,
    pub meta: FileMeta,
    /// Higher runs sooner.
    pub priority: i64,
    /// Components to link to the file once downloaded.
    pub links: Vec<FileLink>,
}

impl QueueRequest {
    pub fn new(site_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            site_id: site_id.into(),
            url: url.into(),
            meta: FileMeta::default(),
            priority: 0,
            links: Vec::new(),
        }
    }

    pub fn with_meta(mut self, meta: FileMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_link(mut self, link: Option<FileLink>) -> Self {
        self.links.extend(link);
        self
    }
}

/// Fold a repeated request into the entry already queued for the file.
///
/// Priority only goes up, links accumulate and newer metadata replaces the
/// old. Returns `None` when nothing changes.
pub fn merge_queue_entry(
    existing: &QueueEntryRow,
    incoming: &QueueEntryRow,
) -> MetadataResult<Option<QueueEntryRow>> {
    let mut merged = existing.clone();
    let mut changed = false;

    if incoming.priority > existing.priority {
        merged.priority = incoming.priority;
        changed = true;
    }
    if incoming.url != existing.url {
        merged.url = incoming.url.clone();
        changed = true;
    }
    if incoming.revision.is_some() && incoming.revision != existing.revision {
        merged.revision = incoming.revision;
        changed = true;
    }
    if incoming.time_modified.is_some() && incoming.time_modified != existing.time_modified {
        merged.time_modified = incoming.time_modified;
        changed = true;
    }
    if incoming.path.is_some() && incoming.path != existing.path {
        merged.path = incoming.path.clone();
        changed = true;
    }
    if incoming.is_external_file != existing.is_external_file {
        merged.is_external_file = incoming.is_external_file;
        changed = true;
    }
    if incoming.repository_type.is_some() && incoming.repository_type != existing.repository_type
    {
        merged.repository_type = incoming.repository_type.clone();
        changed = true;
    }

    let mut links = existing.links()?;
    let before = links.len();
    for link in incoming.links()? {
        if !links.contains(&link) {
            links.push(link);
        }
    }
    if links.len() != before {
        merged.set_links(&links)?;
        changed = true;
    }

    Ok(changed.then_some(merged))
}

/// What one processing step did.
#[derive(Debug, PartialEq, Eq)]
enum Step {
    Processed,
    Retry,
    Empty,
    Unavailable,
}

type TaskKey = (String, FileId);

/// The download queue shared by all sites.
pub struct DownloadQueue {
    metadata: Arc<dyn MetadataStore>,
    storage: Arc<dyn FileStore>,
    network: Arc<dyn NetworkStatus>,
    sites: SiteRegistry,
    downloader: Arc<Downloader>,
    events: EventBus,
    tasks: DashMap<TaskKey, Arc<DownloadTask>>,
    state: watch::Sender<QueueState>,
    runner: Mutex<()>,
    retry_delay: Duration,
    max_priority: i64,
}

impl DownloadQueue {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        storage: Arc<dyn FileStore>,
        network: Arc<dyn NetworkStatus>,
        sites: SiteRegistry,
        downloader: Arc<Downloader>,
        events: EventBus,
        retry_delay: Duration,
        max_priority: i64,
    ) -> Self {
        let (state, _) = watch::channel(QueueState::Paused);
        Self {
            metadata,
            storage,
            network,
            sites,
            downloader,
            events,
            tasks: DashMap::new(),
            state,
            runner: Mutex::new(()),
            retry_delay,
            max_priority,
        }
    }

    pub fn state(&self) -> QueueState {
        *self.state.borrow()
    }

    /// Whether the file has a pending entry with a caller waiting on it.
    pub fn has_pending_task(&self, site_id: &str, file_id: &FileId) -> bool {
        self.tasks
            .get(&(site_id.to_string(), file_id.clone()))
            .is_some_and(|task| !task.is_settled())
    }

    fn set_state(&self, next: QueueState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            info!(state = ?next, "download queue state changed");
        }
    }

    /// Add a file to the queue, or update the entry already queued for it.
    pub async fn enqueue(self: &Arc<Self>, request: QueueRequest) -> EngineResult<Arc<DownloadTask>> {
        let site = self.sites.get(&request.site_id)?;
        if !site.can_download_files() {
            return Err(EngineError::DownloadsDisabled(request.site_id));
        }
        if !self.storage.is_available().await {
            return Err(EngineError::StorageUnavailable);
        }

        let file_id = FileId::from_url(&request.url);
        let version = request.meta.version_for(&request.url);
        let mut entry = QueueEntryRow {
            site_id: request.site_id.clone(),
            file_id: file_id.to_string(),
            url: request.url.clone(),
            priority: request.priority.clamp(0, self.max_priority),
            revision: version.revision,
            time_modified: version.time_modified,
            path: request.meta.path.clone(),
            added: now_millis(),
            links: String::new(),
            is_external_file: request.meta.is_external_file,
            repository_type: request.meta.repository_type.clone(),
        };
        entry.set_links(&request.links)?;

        let key = (request.site_id.clone(), file_id.clone());
        let task = {
            let mut slot = self.tasks.entry(key).or_insert_with(DownloadTask::new);
            if slot.is_settled() {
                *slot = DownloadTask::new();
            }
            slot.clone()
        };

        if self.metadata.insert_queue_entry(&entry).await? {
            debug!(site_id = %entry.site_id, file_id = %file_id, priority = entry.priority, "file queued");
        } else {
            match self.metadata.get_queue_entry(&entry.site_id, &entry.file_id).await? {
                Some(existing) => {
                    if let Some(merged) = merge_queue_entry(&existing, &entry)? {
                        self.metadata.update_queue_entry(&merged).await?;
                        debug!(site_id = %entry.site_id, file_id = %file_id, priority = merged.priority, "queued file updated");
                    }
                }
                // Processed between the two statements.
                None => {
                    self.metadata.insert_queue_entry(&entry).await?;
                }
            }
        }

        self.update_depth().await;
        self.events.emit_file(
            &request.site_id,
            file_id.as_str(),
            FileAction::Downloading,
            None,
            &request.links,
        );
        self.check_processing().await;
        Ok(task)
    }

    /// Start the processing loop if it is not running and can run.
    ///
    /// Call whenever connectivity or storage availability may have changed.
    pub async fn check_processing(self: &Arc<Self>) {
        if !self.network.is_online() || !self.storage.is_available().await {
            self.set_state(QueueState::Paused);
            return;
        }

        let started = self.state.send_if_modified(|state| {
            if *state == QueueState::Running {
                return false;
            }
            *state = QueueState::Running;
            true
        });
        if started {
            info!("download queue started");
            let this = self.clone();
            tokio::spawn(this.run());
        }
    }

    /// Stop after the entry being processed.
    pub fn pause(&self) {
        self.set_state(QueueState::Paused);
    }

    /// Wait until the processing loop has stopped.
    pub async fn wait_until_idle(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| *s == QueueState::Paused).await;
        // The loop may still be finishing its last step.
        let _guard = self.runner.lock().await;
    }

    pub async fn entries(&self, site_id: Option<&str>) -> EngineResult<Vec<QueueEntryRow>> {
        Ok(self.metadata.list_queue_entries(site_id).await?)
    }

    fn run(self: Arc<Self>) -> BoxFuture<'static, ()> {
        async move { self.run_loop().await }.boxed()
    }

    async fn run_loop(self: Arc<Self>) {
        let guard = self.runner.lock().await;
        let mut drained = false;

        loop {
            if self.state() != QueueState::Running {
                break;
            }
            match self.process_next().await {
                Ok(Step::Processed) => tokio::task::yield_now().await,
                Ok(Step::Retry) => tokio::time::sleep(self.retry_delay).await,
                Ok(Step::Empty) => {
                    drained = true;
                    break;
                }
                Ok(Step::Unavailable) => {
                    debug!("environment unavailable, pausing queue");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "queue processing failed, pausing queue");
                    break;
                }
            }
        }

        self.set_state(QueueState::Paused);
        drop(guard);

        // An entry may have been added after the queue looked empty but
        // before it was paused.
        if drained {
            match self.metadata.count_queue_entries().await {
                Ok(0) => {}
                Ok(_) => self.check_processing().await,
                Err(e) => warn!(error = %e, "failed to recount queue"),
            }
        }
    }

    async fn process_next(&self) -> EngineResult<Step> {
        if !self.network.is_online() || !self.storage.is_available().await {
            return Ok(Step::Unavailable);
        }
        match self.metadata.next_queue_entry().await? {
            Some(entry) => self.process_entry(entry).await,
            None => Ok(Step::Empty),
        }
    }

    async fn process_entry(&self, entry: QueueEntryRow) -> EngineResult<Step> {
        let site_id = entry.site_id.clone();
        let file_id = entry.file_id();
        let links = entry.links().unwrap_or_else(|e| {
            warn!(site_id = %site_id, file_id = %file_id, error = %e, "ignoring unreadable links");
            Vec::new()
        });

        let site = match self.sites.get(&site_id) {
            Ok(site) => site,
            Err(e) => {
                warn!(site_id = %site_id, file_id = %file_id, "dropping queue entry of unknown site");
                metrics::record_queue_item("dropped");
                self.finish(&entry, Err(e), &links).await;
                return Ok(Step::Processed);
            }
        };

        if let Some(row) = self.metadata.get_file(&site_id, file_id.as_str()).await? {
            let fresh = !row.is_outdated(&entry.version()) && !row.is_external_file;
            if fresh && self.storage.exists(&row.path).await? {
                debug!(site_id = %site_id, file_id = %file_id, "already downloaded, skipping");
                self.downloader.attach_links(&site_id, &file_id, &links).await;
                metrics::record_queue_item("skipped_fresh");
                self.finish(&entry, Ok(()), &links).await;
                return Ok(Step::Processed);
            }
        }

        let request = DownloadRequest {
            url: entry.url.clone(),
            file_id: file_id.clone(),
            meta: FileMeta {
                revision: entry.revision,
                time_modified: entry.time_modified,
                is_external_file: entry.is_external_file,
                repository_type: entry.repository_type.clone(),
                path: entry.path.clone(),
            },
        };
        let progress = self
            .tasks
            .get(&(site_id.clone(), file_id.clone()))
            .map(|task| task.progress.clone());

        match self.downloader.fetch_shared(site, request, progress).await {
            Ok(_) => {
                // Links may have been added while the transfer ran.
                let links = match self.metadata.get_queue_entry(&site_id, file_id.as_str()).await {
                    Ok(Some(latest)) => latest.links().unwrap_or(links),
                    _ => links,
                };
                self.downloader.attach_links(&site_id, &file_id, &links).await;
                metrics::record_queue_item("downloaded");
                self.finish(&entry, Ok(()), &links).await;
                Ok(Step::Processed)
            }
            Err(e) => {
                let class = e.failure_class();
                match class {
                    FailureClass::Unavailable => Ok(Step::Unavailable),
                    FailureClass::Transient => {
                        warn!(site_id = %site_id, file_id = %file_id, error = %e, "download failed, will retry");
                        metrics::record_download_failure(class.as_str());
                        metrics::record_queue_item("retried");
                        self.events.emit_file(
                            &site_id,
                            file_id.as_str(),
                            FileAction::Download,
                            Some(false),
                            &links,
                        );
                        Ok(Step::Retry)
                    }
                    FailureClass::Permanent => {
                        warn!(site_id = %site_id, file_id = %file_id, error = %e, "download failed, dropping queue entry");
                        metrics::record_download_failure(class.as_str());
                        metrics::record_queue_item("dropped");
                        self.finish(&entry, Err(e), &links).await;
                        Ok(Step::Processed)
                    }
                }
            }
        }
    }

    /// Remove a processed entry, notify and settle its waiting callers.
    async fn finish(&self, entry: &QueueEntryRow, outcome: EngineResult<()>, links: &[FileLink]) {
        let file_id = entry.file_id();
        let task = self
            .tasks
            .remove(&(entry.site_id.clone(), file_id.clone()))
            .map(|(_, task)| task);

        if let Err(e) = self
            .metadata
            .delete_queue_entry(&entry.site_id, &entry.file_id)
            .await
        {
            warn!(site_id = %entry.site_id, file_id = %file_id, error = %e, "failed to delete queue entry");
        }
        self.update_depth().await;

        self.events.emit_file(
            &entry.site_id,
            file_id.as_str(),
            FileAction::Download,
            Some(outcome.is_ok()),
            links,
        );
        if let Some(task) = task {
            match outcome {
                Ok(()) => task.resolve(),
                Err(e) => task.reject(e),
            }
        }
    }

    async fn update_depth(&self) {
        if let Ok(depth) = self.metadata.count_queue_entries().await {
            metrics::QUEUE_DEPTH.set(depth as i64);
        }
    }
}

fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
