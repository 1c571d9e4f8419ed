//! Single-file transfers into the file pool.

use crate::error::{EngineError, EngineResult};
use crate::events::{EventBus, FileAction};
use crate::fetch::{FetchErrorKind, FetchRequest, Fetcher};
use crate::inflight::Inflight;
use crate::metrics;
use crate::sites::{NetworkStatus, Site};
use futures::StreamExt;
use larder_core::file_id::sanitize_filename;
use larder_core::{FileId, FileLink, FileMeta};
use larder_metadata::repos::{FileRepo, LinkRepo, QueueRepo};
use larder_metadata::{FileRow, MetadataStore};
use larder_storage::FileStore;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Most recent progress of one transfer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DownloadProgress {
    pub received: u64,
    /// Size announced by the remote, if any.
    pub total: Option<u64>,
}

/// Where progress of a transfer is published.
pub type ProgressSender = Arc<watch::Sender<Option<DownloadProgress>>>;

/// One file to transfer.
#[derive(Clone, Debug)]
pub struct DownloadRequest {
    /// Remote URL as given by the caller, before site fixes.
    pub url: String,
    pub file_id: FileId,
    pub meta: FileMeta,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, meta: FileMeta) -> Self {
        let url = url.into();
        Self {
            file_id: FileId::from_url(&url),
            url,
            meta,
        }
    }
}

/// Storage key of a file in a site's pool.
pub fn pool_key(site_id: &str, file_id: &FileId) -> String {
    let site_dir = match sanitize_filename(site_id).as_str() {
        "" | "." | ".." => "_".to_string(),
        safe => safe.to_string(),
    };
    format!("sites/{site_dir}/filepool/{file_id}")
}

/// Moves remote files into local storage and records them in the registry.
pub struct Downloader {
    metadata: Arc<dyn MetadataStore>,
    storage: Arc<dyn FileStore>,
    fetcher: Arc<dyn Fetcher>,
    network: Arc<dyn NetworkStatus>,
    events: EventBus,
    inflight: Inflight<(String, FileId), FileRow>,
}

impl Downloader {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        storage: Arc<dyn FileStore>,
        fetcher: Arc<dyn Fetcher>,
        network: Arc<dyn NetworkStatus>,
        events: EventBus,
    ) -> Self {
        Self {
            metadata,
            storage,
            fetcher,
            network,
            events,
            inflight: Inflight::new(),
        }
    }

    /// Whether a transfer for the file is running right now.
    pub fn is_downloading(&self, site_id: &str, file_id: &FileId) -> bool {
        self.inflight
            .contains(&(site_id.to_string(), file_id.clone()))
    }

    /// Transfer a file, joining a transfer already running for it.
    pub async fn fetch_shared(
        self: &Arc<Self>,
        site: Arc<dyn Site>,
        request: DownloadRequest,
        progress: Option<ProgressSender>,
    ) -> EngineResult<FileRow> {
        let key = (site.id().to_string(), request.file_id.clone());
        let this = self.clone();
        self.inflight
            .run(key, async move { this.fetch_to_pool(site, request, progress).await })
            .await
    }

    async fn fetch_to_pool(
        &self,
        site: Arc<dyn Site>,
        request: DownloadRequest,
        progress: Option<ProgressSender>,
    ) -> EngineResult<FileRow> {
        if !self.network.is_online() {
            return Err(EngineError::Offline);
        }
        if !self.storage.is_available().await {
            return Err(EngineError::StorageUnavailable);
        }

        let site_id = site.id();
        let file_id = request.file_id.as_str();
        let existing = self.metadata.get_file(site_id, file_id).await?;
        let path = request
            .meta
            .path
            .clone()
            .or_else(|| existing.as_ref().map(|row| row.path.clone()))
            .unwrap_or_else(|| pool_key(site_id, &request.file_id));
        let requested = request.meta.version_for(&request.url);

        let previous_path = existing
            .as_ref()
            .map(|row| row.path.clone())
            .filter(|previous| *previous != path);

        // Ask the remote to skip the body when the copy we hold is current.
        let mut refreshable = None;
        if let Some(row) = existing.filter(|row| row.path == path && !row.is_external_file) {
            if !row.version().is_older_than(&requested) && self.storage.exists(&path).await? {
                refreshable = Some(row);
            }
        }

        let fetch_request = FetchRequest {
            url: site.fix_url(&request.url),
            if_modified_since: refreshable.as_ref().map(|row| row.download_time),
        };
        let started = Instant::now();
        let response = match self.fetcher.fetch(fetch_request).await {
            Ok(response) => response,
            Err(e) if e.kind == FetchErrorKind::NotModified => match refreshable {
                Some(mut row) => {
                    row.url = request.url.clone();
                    row.stale = false;
                    row.revision = requested.revision.or(row.revision);
                    row.time_modified = requested.time_modified.or(row.time_modified);
                    self.metadata.upsert_file(&row).await?;
                    metrics::FILES_NOT_MODIFIED.inc();
                    debug!(site_id, file_id, "remote not modified, local copy refreshed");
                    return Ok(row);
                }
                None => return Err(e.into()),
            },
            Err(e) => return Err(e.into()),
        };

        let total = response.content_length;
        let report = |received: u64| {
            if let Some(sender) = &progress {
                sender.send_replace(Some(DownloadProgress { received, total }));
            }
        };
        report(0);

        let mut upload = self.storage.put_stream(&path).await?;
        let mut body = response.body;
        while let Some(chunk) = body.next().await {
            let written = match chunk {
                Ok(chunk) => upload.write(chunk).await.map_err(EngineError::from),
                Err(e) => Err(e.into()),
            };
            if let Err(e) = written {
                if let Err(abort_err) = upload.abort().await {
                    warn!(site_id, file_id, error = %abort_err, "failed to discard partial download");
                }
                return Err(e);
            }
            report(upload.bytes_written());
        }
        let size = upload.finish().await?;

        let row = FileRow {
            site_id: site_id.to_string(),
            file_id: file_id.to_string(),
            url: request.url.clone(),
            path,
            extension: request.file_id.extension().map(str::to_string),
            size: size as i64,
            revision: requested.revision,
            time_modified: requested.time_modified,
            is_external_file: request.meta.is_external_file,
            repository_type: request.meta.repository_type.clone(),
            stale: false,
            download_time: OffsetDateTime::now_utc(),
        };
        self.metadata.upsert_file(&row).await?;
        if let Some(previous) = previous_path {
            if let Err(e) = self.storage.delete(&previous).await {
                warn!(site_id, file_id, path = %previous, error = %e, "failed to remove previous local copy");
            }
        }

        metrics::FILES_DOWNLOADED.inc();
        metrics::BYTES_DOWNLOADED.inc_by(size);
        metrics::DOWNLOAD_DURATION.observe(started.elapsed().as_secs_f64());
        info!(site_id, file_id, size, path = %row.path, "file downloaded");
        Ok(row)
    }

    /// Download a file right away, bypassing the queue.
    ///
    /// A local copy that is current (or any local copy when `ignore_stale`)
    /// is returned without a transfer.
    pub async fn download(
        self: &Arc<Self>,
        site: Arc<dyn Site>,
        request: DownloadRequest,
        links: &[FileLink],
        ignore_stale: bool,
    ) -> EngineResult<FileRow> {
        let site_id = site.id().to_string();
        let file_id = request.file_id.clone();
        let requested = request.meta.version_for(&request.url);

        if let Some(row) = self.metadata.get_file(&site_id, file_id.as_str()).await? {
            let usable = ignore_stale || !row.is_outdated(&requested);
            if usable && self.storage.exists(&row.path).await? {
                self.attach_links(&site_id, &file_id, links).await;
                return Ok(row);
            }
        }

        match self.fetch_shared(site, request, None).await {
            Ok(row) => {
                self.attach_links(&site_id, &file_id, links).await;
                self.events.emit_file(
                    &site_id,
                    file_id.as_str(),
                    FileAction::Download,
                    Some(true),
                    links,
                );
                Ok(row)
            }
            Err(e) => {
                metrics::record_download_failure(e.failure_class().as_str());
                self.events.emit_file(
                    &site_id,
                    file_id.as_str(),
                    FileAction::Download,
                    Some(false),
                    links,
                );
                Err(e)
            }
        }
    }

    /// Record component links for a stored file. Failures are logged only.
    pub async fn attach_links(&self, site_id: &str, file_id: &FileId, links: &[FileLink]) {
        if links.is_empty() {
            return;
        }
        if let Err(e) = self
            .metadata
            .add_links(site_id, file_id.as_str(), links)
            .await
        {
            warn!(site_id, file_id = %file_id, error = %e, "failed to attach file links");
        }
    }

    /// Forget a stored file: its registry row, links, queue entry and local copy.
    ///
    /// Returns false if the registry had no such file.
    pub async fn remove_file(&self, site_id: &str, file_id: &FileId) -> EngineResult<bool> {
        let Some(row) = self.metadata.get_file(site_id, file_id.as_str()).await? else {
            return Ok(false);
        };
        let links: Vec<FileLink> = self
            .metadata
            .links_for_file(site_id, file_id.as_str())
            .await?
            .into_iter()
            .map(FileLink::from)
            .collect();

        self.metadata.delete_file(site_id, file_id.as_str()).await?;
        if let Err(e) = self
            .metadata
            .delete_queue_entry(site_id, file_id.as_str())
            .await
        {
            warn!(site_id, file_id = %file_id, error = %e, "failed to drop queue entry of removed file");
        }
        if !self.storage.delete(&row.path).await? {
            debug!(site_id, file_id = %file_id, path = %row.path, "local copy was already gone");
        }

        info!(site_id, file_id = %file_id, "file removed");
        self.events
            .emit_file(site_id, file_id.as_str(), FileAction::Deleted, None, &links);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_key() {
        let id = FileId::from_stored("a_0123.pdf");
        assert_eq!(pool_key("school", &id), "sites/school/filepool/a_0123.pdf");
        assert_eq!(
            pool_key("https://school/x", &id),
            "sites/https_school_x/filepool/a_0123.pdf"
        );
        assert_eq!(pool_key("..", &id), "sites/_/filepool/a_0123.pdf");
    }

    #[test]
    fn test_request_derives_identity() {
        let a = DownloadRequest::new("https://h/f.pdf?token=1", FileMeta::default());
        let b = DownloadRequest::new("https://h/f.pdf?token=2", FileMeta::default());
        assert_eq!(a.file_id, b.file_id);
        assert_eq!(a.url, "https://h/f.pdf?token=1");
    }
}
