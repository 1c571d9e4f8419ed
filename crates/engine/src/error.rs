//! Engine error types and failure classification.

use crate::fetch::{FetchError, FetchErrorKind};
use larder_metadata::MetadataError;
use larder_storage::StorageError;
use std::sync::Arc;

/// How a failed download is handled by the queue processor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureClass {
    /// No network or no storage. The queue pauses and keeps the entry.
    Unavailable,
    /// Worth retrying. The entry stays queued.
    Transient,
    /// Retrying cannot help. The entry is dropped and callers are rejected.
    Permanent,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unavailable => "unavailable",
            Self::Transient => "transient",
            Self::Permanent => "permanent",
        }
    }
}

/// Engine error type.
///
/// Cloneable so one outcome can be handed to every caller waiting on a
/// shared operation.
#[derive(Clone, Debug, thiserror::Error)]
pub enum EngineError {
    #[error("device is offline")]
    Offline,

    #[error("local storage is not available")]
    StorageUnavailable,

    #[error("unknown site: {0}")]
    UnknownSite(String),

    #[error("site {0} does not allow file downloads")]
    DownloadsDisabled(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("storage error: {0}")]
    Storage(Arc<StorageError>),

    #[error("metadata error: {0}")]
    Metadata(Arc<MetadataError>),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StorageError> for EngineError {
    fn from(e: StorageError) -> Self {
        EngineError::Storage(Arc::new(e))
    }
}

impl From<MetadataError> for EngineError {
    fn from(e: MetadataError) -> Self {
        EngineError::Metadata(Arc::new(e))
    }
}

impl EngineError {
    /// Classify this error for queue processing.
    pub fn failure_class(&self) -> FailureClass {
        match self {
            EngineError::Offline | EngineError::StorageUnavailable => FailureClass::Unavailable,
            EngineError::Fetch(e) => e.kind.failure_class(),
            EngineError::Storage(e) => match e.as_ref() {
                StorageError::QuotaExceeded(_) | StorageError::InvalidKey(_) => {
                    FailureClass::Permanent
                }
                _ => FailureClass::Transient,
            },
            EngineError::Metadata(_) | EngineError::Internal(_) => FailureClass::Transient,
            EngineError::UnknownSite(_)
            | EngineError::DownloadsDisabled(_)
            | EngineError::NotFound(_)
            | EngineError::Config(_) => FailureClass::Permanent,
        }
    }

    /// Short machine-readable code for logs and CLI output.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Offline => "offline",
            EngineError::StorageUnavailable => "storage_unavailable",
            EngineError::UnknownSite(_) => "unknown_site",
            EngineError::DownloadsDisabled(_) => "downloads_disabled",
            EngineError::NotFound(_) => "not_found",
            EngineError::Config(_) => "config_error",
            EngineError::Fetch(e) => e.kind.as_str(),
            EngineError::Storage(_) => "storage_error",
            EngineError::Metadata(_) => "metadata_error",
            EngineError::Internal(_) => "internal_error",
        }
    }
}

impl FetchErrorKind {
    pub fn failure_class(&self) -> FailureClass {
        match self {
            FetchErrorKind::Connection | FetchErrorKind::Aborted => FailureClass::Transient,
            FetchErrorKind::Http(status) if *status >= 500 || *status == 408 || *status == 429 => {
                FailureClass::Transient
            }
            FetchErrorKind::NotFound
            | FetchErrorKind::InvalidUrl
            | FetchErrorKind::NotModified
            | FetchErrorKind::QuotaExceeded
            | FetchErrorKind::InvalidResponse
            | FetchErrorKind::Http(_) => FailureClass::Permanent,
        }
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;
