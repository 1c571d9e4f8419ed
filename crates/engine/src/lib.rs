//! Content fetch and cache engine.
//!
//! This crate provides:
//! - Resolution of remote file URLs to local copies
//! - A persistent, priority-ordered download queue
//! - De-duplication of concurrent file and package downloads
//! - Package status tracking with rollback on failure
//! - Change notifications for files and packages

pub mod download;
pub mod engine;
pub mod error;
pub mod events;
pub mod fetch;
pub mod inflight;
pub mod metrics;
pub mod packages;
pub mod queue;
pub mod sites;

pub use download::DownloadProgress;
pub use engine::{Engine, InvalidateScope, ResolveOptions, SizeCheck};
pub use error::{EngineError, EngineResult, FailureClass};
pub use events::{
    EngineEvent, EventFilter, EventStream, FileAction, FileEvent, PackageStatusEvent,
};
pub use fetch::{FetchError, FetchErrorKind, FetchRequest, FetchResponse, Fetcher, HttpFetcher};
pub use queue::{DownloadTask, QueueState};
pub use sites::{NetworkStatus, Site, SiteRegistry, StaticNetwork, StaticSite};

use larder_core::config::AppConfig;
use std::sync::Arc;

/// Build an engine from configuration, fetching over HTTP.
pub async fn from_config(
    config: &AppConfig,
    network: Arc<dyn NetworkStatus>,
) -> EngineResult<Engine> {
    config.validate().map_err(EngineError::Config)?;
    metrics::register_metrics();

    let metadata = larder_metadata::from_config(&config.metadata).await?;
    let storage = larder_storage::from_config(&config.storage).await?;
    Ok(Engine::new(
        config.engine.clone(),
        metadata,
        storage,
        Arc::new(HttpFetcher::new()),
        network,
    ))
}
